//! Collaborator interfaces consumed by the conversation runtime.
//!
//! Remote records cross these seams as loosely-typed JSON; mapping them to
//! `chat_core::Message` is the runtime's job.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chat_core::{MentionRange, OutgoingMessage, ReadWatermark, TypingPresence};
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

mod memory;

pub use memory::InMemoryChatService;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Live typing facts of one conversation, keyed by user ID.
pub type PresenceSet = BTreeMap<String, TypingPresence>;

/// Remote message service.
#[async_trait]
pub trait RemoteMessageStore: Send + Sync {
    /// Newest-first page of records, optionally older than `before`.
    async fn list_messages(
        &self,
        conversation_id: &str,
        limit: u16,
        before: Option<&str>,
    ) -> Result<Vec<Value>, PlatformError>;

    /// Persist an outgoing message and return the confirmed record.
    async fn send_message(&self, input: OutgoingMessage) -> Result<Value, PlatformError>;

    /// Replace the body of a message and return the updated record.
    async fn edit_message(
        &self,
        message_id: &str,
        content: &str,
        mentions: &[MentionRange],
    ) -> Result<Value, PlatformError>;

    async fn delete_message(&self, message_id: &str) -> Result<(), PlatformError>;

    /// User IDs allowed to post in a conversation.
    async fn list_members(&self, conversation_id: &str) -> Result<Vec<String>, PlatformError>;
}

/// Change delivered by the push stream, at least once.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Insert(Value),
    Update(Value),
    Delete { message_id: String },
}

/// Open push subscription for one conversation. Dropping it unsubscribes.
#[derive(Debug)]
pub struct PushSubscription {
    conversation_id: String,
    events: mpsc::UnboundedReceiver<PushEvent>,
}

impl PushSubscription {
    pub fn new(
        conversation_id: impl Into<String>,
        events: mpsc::UnboundedReceiver<PushEvent>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            events,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<PushEvent> {
        self.events.recv().await
    }
}

#[async_trait]
pub trait PushStream: Send + Sync {
    async fn subscribe(&self, conversation_id: &str) -> Result<PushSubscription, PlatformError>;
}

/// Remote read-watermark storage and the authoritative unread aggregate.
#[async_trait]
pub trait WatermarkPersistence: Send + Sync {
    async fn get_watermark(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<ReadWatermark>, PlatformError>;

    async fn set_watermark(&self, watermark: &ReadWatermark) -> Result<(), PlatformError>;

    /// Messages not authored by `user_id` created strictly after `since`.
    async fn count_unread(
        &self,
        conversation_id: &str,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64, PlatformError>;
}

/// Ephemeral pub/sub with join/leave semantics keyed by conversation and user.
#[async_trait]
pub trait PresenceTransport: Send + Sync {
    async fn join(&self, conversation_id: &str, presence: TypingPresence)
    -> Result<(), PlatformError>;

    async fn leave(&self, conversation_id: &str, user_id: &str) -> Result<(), PlatformError>;

    /// Live membership; the current set is visible immediately on subscribe.
    async fn watch(&self, conversation_id: &str)
    -> Result<watch::Receiver<PresenceSet>, PlatformError>;
}
