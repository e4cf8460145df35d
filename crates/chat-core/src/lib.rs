//! Core conversation-state contract shared by the runtime and its views.
//!
//! This crate defines the command/event protocol and session lifecycle, plus
//! the pure engines behind a conversation view: timeline reconciliation,
//! watermark arithmetic, divider composition and mention tracking.

/// Async command/event channel primitives.
pub mod channel;
/// Day and unread divider composition.
pub mod dividers;
/// Stable error types.
pub mod error;
/// `@mention` trigger detection and range tracking.
pub mod mention;
/// Remote record ingestion and send acknowledgement helpers.
pub mod normalization;
/// Session lifecycle state machine.
pub mod state_machine;
/// Optimistic timeline reconciliation.
pub mod timeline;
/// View-facing protocol types (commands, events, payloads).
pub mod types;
/// Unread and mention arithmetic.
pub mod watermark;

pub use channel::{EventSink, EventStream, RuntimeChannelError, RuntimeChannels};
pub use error::{ChatError, ChatErrorCategory};
pub use mention::{MentionCandidate, MentionIndexer, MentionQuery, active_mention_query};
pub use normalization::{
    SendOutcome, normalize_fatal_error, normalize_message_record, normalize_send_outcome,
};
pub use state_machine::SessionStateMachine;
pub use timeline::{ConversationTimeline, ReconcileOutcome, TimelineEvent, TimelineMergeError};
pub use types::{
    ConversationCommand, ConversationEvent, MentionRange, Message, MessageKind, MessageStatus,
    OutgoingMessage, PENDING_ID_PREFIX, ReadWatermark, RenderItem, RuntimeConfig, SendAck,
    SessionLifecycleState, TypingPresence, new_client_txn_id,
};
