use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix used for client-generated placeholder ids.
pub const PENDING_ID_PREFIX: &str = "local-";

/// Content kind of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum MessageKind {
    /// Plain text message.
    #[default]
    Text,
    /// Image attachment.
    Image,
    /// Video attachment.
    Video,
    /// Audio clip.
    Audio,
    /// Generic document attachment.
    Document,
}

impl MessageKind {
    /// Parse the lowercase wire name used by remote records.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "document" | "file" => Some(Self::Document),
            _ => None,
        }
    }
}

/// Delivery status of a message.
///
/// Variants are ordered so that a later status compares greater.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub enum MessageStatus {
    /// Created locally, awaiting server confirmation.
    #[default]
    Pending,
    /// Accepted by the server.
    Sent,
    /// Delivered to at least one recipient.
    Delivered,
    /// Read by at least one recipient.
    Read,
}

impl MessageStatus {
    /// Parse the lowercase wire name used by remote records.
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            _ => None,
        }
    }
}

/// Span of a message body bound to a mentioned user.
///
/// `start` and `end` are byte offsets into the content the range was
/// composed against, `end` exclusive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MentionRange {
    /// Mentioned user ID.
    pub user_id: String,
    /// Text inserted for the mention, for example `@John`.
    pub display: String,
    /// Inclusive start offset.
    pub start: usize,
    /// Exclusive end offset.
    pub end: usize,
}

impl MentionRange {
    /// Length of the mention span in bytes.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Whether the span is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this span shares at least one byte with `start..end`.
    pub fn intersects(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }
}

/// One message of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Server ID, or a `local-` prefixed synthetic ID while pending.
    pub id: String,
    /// Owning conversation ID.
    pub conversation_id: String,
    /// Author user ID.
    pub sender_id: String,
    /// Message body.
    pub content: String,
    /// Server timestamp; provisional while pending.
    pub created_at: DateTime<Utc>,
    /// Last edit timestamp, when edited.
    pub updated_at: Option<DateTime<Utc>>,
    /// ID of the message this one replies to.
    pub reply_to_id: Option<String>,
    /// Mention spans inside `content`.
    pub mentions: Vec<MentionRange>,
    /// Content kind.
    pub kind: MessageKind,
    /// Delivery status.
    pub status: MessageStatus,
}

impl Message {
    /// Build a pending placeholder for an outgoing message.
    pub fn pending(outgoing: &OutgoingMessage, provisional_at: DateTime<Utc>) -> Self {
        Self {
            id: outgoing.client_txn_id.clone(),
            conversation_id: outgoing.conversation_id.clone(),
            sender_id: outgoing.sender_id.clone(),
            content: outgoing.content.clone(),
            created_at: provisional_at,
            updated_at: None,
            reply_to_id: outgoing.reply_to_id.clone(),
            mentions: outgoing.mentions.clone(),
            kind: outgoing.kind,
            status: MessageStatus::Pending,
        }
    }

    /// Whether the message is a local placeholder awaiting confirmation.
    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }

    /// Whether any mention span targets `user_id`.
    pub fn mentions_user(&self, user_id: &str) -> bool {
        self.mentions.iter().any(|mention| mention.user_id == user_id)
    }

    /// Reply target with absence normalized to an empty string.
    pub fn reply_key(&self) -> &str {
        self.reply_to_id.as_deref().unwrap_or("")
    }
}

/// Input for a remote send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Client transaction ID, reused as the placeholder ID.
    pub client_txn_id: String,
    /// Target conversation ID.
    pub conversation_id: String,
    /// Author user ID.
    pub sender_id: String,
    /// Message body.
    pub content: String,
    /// Optional reply target.
    pub reply_to_id: Option<String>,
    /// Mention spans inside `content`.
    pub mentions: Vec<MentionRange>,
    /// Content kind.
    pub kind: MessageKind,
}

/// Generate a fresh client transaction ID for a pending message.
pub fn new_client_txn_id() -> String {
    format!("{PENDING_ID_PREFIX}{}", Uuid::new_v4())
}

/// Last message a user acknowledged reading in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadWatermark {
    /// Reader user ID.
    pub user_id: String,
    /// Conversation ID.
    pub conversation_id: String,
    /// ID of the last read message.
    pub last_read_message_id: String,
    /// `created_at` of the last read message.
    pub last_read_at: DateTime<Utc>,
}

impl ReadWatermark {
    /// Watermark pointing at `message` for `user_id`.
    pub fn at(user_id: impl Into<String>, message: &Message) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: message.conversation_id.clone(),
            last_read_message_id: message.id.clone(),
            last_read_at: message.created_at,
        }
    }

    /// Whether moving the watermark to `target` keeps read state monotonic.
    pub fn allows_advance_to(&self, target: DateTime<Utc>) -> bool {
        target >= self.last_read_at
    }
}

/// Ephemeral "is typing" fact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingPresence {
    /// Typing user ID.
    pub user_id: String,
    /// Typing user display name.
    pub user_name: String,
    /// When the fact was last refreshed.
    pub timestamp: DateTime<Utc>,
}

/// One row of the composed conversation view, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RenderItem {
    /// A message row.
    Message(Message),
    /// Calendar day boundary.
    DayDivider {
        /// Local calendar day of the older side of the boundary.
        date: NaiveDate,
    },
    /// Boundary between read and unread messages.
    UnreadDivider {
        /// Unread message count shown on the divider.
        count: usize,
    },
}

impl RenderItem {
    /// Message payload when this row is a message.
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }
}

/// Tuning values for a conversation runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Cap for resident timeline entries.
    pub timeline_max_items: usize,
    /// Number of messages loaded when a conversation opens.
    pub open_limit: u16,
    /// Hard cap for a single history page.
    pub page_limit_cap: u16,
    /// Inactivity window after which a typing fact expires.
    pub typing_expiry_ms: u64,
    /// Command channel capacity.
    pub command_buffer: usize,
    /// Event broadcast capacity.
    pub event_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeline_max_items: 1_200,
            open_limit: 30,
            page_limit_cap: 100,
            typing_expiry_ms: 3_000,
            command_buffer: 128,
            event_buffer: 512,
        }
    }
}

/// Lifecycle of a mounted conversation view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionLifecycleState {
    /// No conversation mounted yet.
    Idle,
    /// History and subscriptions for a conversation are being set up.
    Opening,
    /// A conversation is mounted and accepts timeline commands.
    Active,
    /// The view was unmounted.
    Closed,
}

/// Command channel input accepted by a conversation runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConversationCommand {
    /// Mount a conversation, replacing any mounted one.
    Open {
        /// Target conversation ID.
        conversation_id: String,
    },
    /// Load the page of history preceding the oldest resident message.
    LoadOlder {
        /// Requested page size (subject to caps).
        limit: u16,
    },
    /// Send a message with optimistic local placement.
    Send {
        /// Frontend-provided transaction ID echoed in `SendAck`.
        client_txn_id: String,
        /// Message body.
        content: String,
        /// Optional reply target.
        reply_to_id: Option<String>,
        /// Mention spans inside `content`.
        mentions: Vec<MentionRange>,
        /// Content kind.
        kind: MessageKind,
    },
    /// Edit one of the user's own messages.
    Edit {
        /// Target message ID.
        message_id: String,
        /// Replacement body.
        content: String,
        /// Replacement mention spans.
        mentions: Vec<MentionRange>,
    },
    /// Delete one of the user's own messages.
    Delete {
        /// Target message ID.
        message_id: String,
    },
    /// Advance the read watermark to a message.
    MarkRead {
        /// Target message ID.
        message_id: String,
    },
    /// Publish or refresh the user's typing fact.
    StartTyping,
    /// Retract the user's typing fact.
    StopTyping,
    /// Unmount the conversation.
    Close,
}

/// Acknowledgement for a send command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Original frontend transaction ID.
    pub client_txn_id: String,
    /// Confirmed message ID on success.
    pub message_id: Option<String>,
    /// Stable error code on failure.
    pub error_code: Option<String>,
}

/// Event channel output emitted by a conversation runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConversationEvent {
    /// Lifecycle transition.
    StateChanged {
        /// New lifecycle state.
        state: SessionLifecycleState,
    },
    /// Fresh render sequence for the mounted conversation.
    TimelineUpdated {
        /// Conversation ID.
        conversation_id: String,
        /// Composed rows, newest first.
        items: Vec<RenderItem>,
        /// Unread messages not authored by the user.
        unread_count: u64,
        /// Most recent unread message mentioning the user.
        latest_unread_mention_id: Option<String>,
    },
    /// Other users currently typing.
    TypingChanged {
        /// Conversation ID.
        conversation_id: String,
        /// Active typing facts, own facts excluded.
        users: Vec<TypingPresence>,
    },
    /// Send acknowledgement.
    SendAck(SendAck),
    /// Failure surfaced to the UI.
    FatalError {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
        /// Whether retrying may succeed.
        recoverable: bool,
    },
}
