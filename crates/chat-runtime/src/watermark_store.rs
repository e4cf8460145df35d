//! Read watermarks per (conversation, user) over [`WatermarkPersistence`].

use std::sync::Arc;

use chat_core::{Message, ReadWatermark, watermark};
use chat_platform::{PlatformError, WatermarkPersistence};
use tokio::sync::Mutex;
use tracing::debug;

/// Result of a mark-read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkReadOutcome {
    /// The watermark moved to the requested message.
    Advanced(ReadWatermark),
    /// The target is older than the current watermark; nothing changed.
    NoOp { current: ReadWatermark },
}

/// Unread state derived from one watermark read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadSnapshot {
    pub watermark: Option<ReadWatermark>,
    pub unread_count: u64,
    pub latest_unread_mention_id: Option<String>,
}

/// Unread counting and monotonic mark-read.
///
/// Unread counts come from the remote aggregate. Mention state is evaluated
/// over the message window the caller has loaded.
#[derive(Clone)]
pub struct WatermarkStore {
    persistence: Arc<dyn WatermarkPersistence>,
    mark_read_lock: Arc<Mutex<()>>,
}

impl WatermarkStore {
    pub fn new(persistence: Arc<dyn WatermarkPersistence>) -> Self {
        Self {
            persistence,
            mark_read_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn watermark(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<ReadWatermark>, PlatformError> {
        self.persistence
            .get_watermark(conversation_id, user_id)
            .await
    }

    /// Messages not authored by `user_id` newer than their watermark.
    pub async fn unread_count(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<u64, PlatformError> {
        let current = self.watermark(conversation_id, user_id).await?;
        self.persistence
            .count_unread(
                conversation_id,
                user_id,
                watermark::read_since(current.as_ref()),
            )
            .await
    }

    /// Move the watermark to `target` unless that would regress it.
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        target: &Message,
    ) -> Result<MarkReadOutcome, PlatformError> {
        if target.conversation_id != conversation_id {
            return Err(PlatformError::NotFound(format!(
                "message '{}' in conversation '{conversation_id}'",
                target.id
            )));
        }

        let _guard = self.mark_read_lock.lock().await;
        let current = self.watermark(conversation_id, user_id).await?;
        if !watermark::should_advance(current.as_ref(), target.created_at)
            && let Some(current) = current
        {
            debug!(
                %conversation_id,
                %user_id,
                current = %current.last_read_message_id,
                target = %target.id,
                "mark read ignored; target is older than watermark"
            );
            return Ok(MarkReadOutcome::NoOp { current });
        }

        let next = ReadWatermark::at(user_id, target);
        self.persistence.set_watermark(&next).await?;
        debug!(
            %conversation_id,
            %user_id,
            message_id = %target.id,
            "watermark advanced"
        );
        Ok(MarkReadOutcome::Advanced(next))
    }

    pub async fn has_unread_mention(
        &self,
        conversation_id: &str,
        user_id: &str,
        window: &[Message],
    ) -> Result<bool, PlatformError> {
        let current = self.watermark(conversation_id, user_id).await?;
        Ok(watermark::has_unread_mention(
            window,
            watermark::read_since(current.as_ref()),
            user_id,
        ))
    }

    /// Most recent unread message in `window` mentioning `user_id`.
    pub async fn latest_unread_mention_id(
        &self,
        conversation_id: &str,
        user_id: &str,
        window: &[Message],
    ) -> Result<Option<String>, PlatformError> {
        let current = self.watermark(conversation_id, user_id).await?;
        Ok(
            watermark::latest_unread_mention_id(
                window,
                watermark::read_since(current.as_ref()),
                user_id,
            )
            .map(str::to_owned),
        )
    }

    /// Watermark, unread count and latest unread mention from a single
    /// watermark read.
    pub async fn snapshot(
        &self,
        conversation_id: &str,
        user_id: &str,
        window: &[Message],
    ) -> Result<UnreadSnapshot, PlatformError> {
        let current = self.watermark(conversation_id, user_id).await?;
        let since = watermark::read_since(current.as_ref());
        let unread_count = self
            .persistence
            .count_unread(conversation_id, user_id, since)
            .await?;
        let latest_unread_mention_id =
            watermark::latest_unread_mention_id(window, since, user_id).map(str::to_owned);

        Ok(UnreadSnapshot {
            watermark: current,
            unread_count,
            latest_unread_mention_id,
        })
    }
}
