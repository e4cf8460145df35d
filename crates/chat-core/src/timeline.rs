use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::types::{Message, MessageStatus};

/// Caller errors rejected by the timeline.
///
/// Missing-data cases (unknown IDs) are not errors; they resolve to
/// [`ReconcileOutcome::Ignored`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimelineMergeError {
    /// A message for another conversation was fed into this timeline.
    #[error("message '{message_id}' belongs to conversation '{actual}', not '{expected}'")]
    ConversationMismatch {
        message_id: String,
        expected: String,
        actual: String,
    },
    /// `append` was called with a message that is not a pending placeholder.
    #[error("message '{0}' is not a pending placeholder")]
    NotPending(String),
    /// `append` was called twice with the same placeholder ID.
    #[error("placeholder '{0}' is already in the timeline")]
    DuplicatePlaceholder(String),
}

/// Event applied to a timeline, mirroring the push stream and local actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEvent {
    /// Server-confirmed message (push echo or send response).
    Confirmed(Message),
    /// Server-side edit of an existing message.
    Updated(Message),
    /// A pending send failed for good.
    SendFailed { pending_id: String },
    /// A message was deleted.
    Deleted { message_id: String },
}

/// What applying one event did to the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Inserted at the head.
    Inserted,
    /// Replaced the pending placeholder at `index` in place.
    ReplacedPending { index: usize },
    /// Already present; nothing changed.
    Duplicate,
    /// Mutable fields of the entry at `index` were updated.
    Updated { index: usize },
    /// Entry at `index` was removed.
    Removed { index: usize },
    /// Referenced entry is not resident; nothing changed.
    Ignored,
}

impl ReconcileOutcome {
    /// Whether the visible list changed.
    pub fn changed(self) -> bool {
        !matches!(self, Self::Duplicate | Self::Ignored)
    }
}

/// Canonical newest-first message list for one conversation.
#[derive(Debug, Clone)]
pub struct ConversationTimeline {
    conversation_id: String,
    items: Vec<Message>,
    max_items: usize,
}

impl ConversationTimeline {
    /// Create an empty timeline with an item cap (`max_items >= 1`).
    pub fn new(conversation_id: impl Into<String>, max_items: usize) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            items: Vec::new(),
            max_items: max_items.max(1),
        }
    }

    /// Conversation this timeline belongs to.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Resident messages, newest first.
    pub fn messages(&self) -> &[Message] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Look up a resident message by ID.
    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.items.iter().find(|message| message.id == message_id)
    }

    /// Number of in-flight placeholders.
    pub fn pending_count(&self) -> usize {
        self.items.iter().filter(|message| message.is_pending()).count()
    }

    /// ID of the oldest confirmed message, used as the pagination cursor.
    pub fn oldest_confirmed_id(&self) -> Option<&str> {
        self.items
            .iter()
            .rev()
            .find(|message| !message.is_pending())
            .map(|message| message.id.as_str())
    }

    /// Insert a pending placeholder at the head.
    pub fn append(&mut self, pending: Message) -> Result<(), TimelineMergeError> {
        self.ensure_conversation(&pending)?;
        if !pending.is_pending() {
            return Err(TimelineMergeError::NotPending(pending.id));
        }
        if self.position(&pending.id).is_some() {
            return Err(TimelineMergeError::DuplicatePlaceholder(pending.id));
        }

        trace!(
            conversation_id = %self.conversation_id,
            pending_id = %pending.id,
            "appending pending placeholder"
        );
        self.items.insert(0, pending);
        self.trim_to_max(0);
        Ok(())
    }

    /// Merge one server-confirmed message.
    ///
    /// Duplicate deliveries are ignored. A pending placeholder from the same
    /// sender with the same trimmed content and reply target is replaced in
    /// place; otherwise the message goes to the head.
    pub fn on_confirmed(
        &mut self,
        mut message: Message,
    ) -> Result<ReconcileOutcome, TimelineMergeError> {
        self.ensure_conversation(&message)?;
        if self.position(&message.id).is_some() {
            trace!(message_id = %message.id, "duplicate confirmation ignored");
            return Ok(ReconcileOutcome::Duplicate);
        }

        message.status = message.status.max(MessageStatus::Sent);

        if let Some(index) = self.matching_placeholder(&message) {
            debug!(
                conversation_id = %self.conversation_id,
                pending_id = %self.items[index].id,
                message_id = %message.id,
                index,
                "placeholder confirmed in place"
            );
            self.items[index] = message;
            return Ok(ReconcileOutcome::ReplacedPending { index });
        }

        if self.has_pending_from(&message.sender_id) {
            warn!(
                conversation_id = %self.conversation_id,
                message_id = %message.id,
                "confirmation from a sender with pending placeholders matched none; inserting at head"
            );
        }
        self.items.insert(0, message);
        self.trim_to_max(1);
        Ok(ReconcileOutcome::Inserted)
    }

    /// Apply an edit to the entry with the same ID without moving it.
    pub fn on_updated(&mut self, message: Message) -> Result<ReconcileOutcome, TimelineMergeError> {
        self.ensure_conversation(&message)?;
        let Some(index) = self.position(&message.id) else {
            debug!(message_id = %message.id, "update for non-resident message ignored");
            return Ok(ReconcileOutcome::Ignored);
        };

        let existing = &mut self.items[index];
        existing.content = message.content;
        existing.mentions = message.mentions;
        existing.updated_at = message.updated_at;
        Ok(ReconcileOutcome::Updated { index })
    }

    /// Remove a placeholder whose send failed.
    pub fn on_send_failed(&mut self, pending_id: &str) -> ReconcileOutcome {
        match self
            .items
            .iter()
            .position(|message| message.id == pending_id && message.is_pending())
        {
            Some(index) => {
                self.items.remove(index);
                debug!(%pending_id, index, "failed placeholder removed");
                ReconcileOutcome::Removed { index }
            }
            None => ReconcileOutcome::Ignored,
        }
    }

    /// Remove the entry with `message_id`.
    pub fn on_delete(&mut self, message_id: &str) -> ReconcileOutcome {
        match self.position(message_id) {
            Some(index) => {
                self.items.remove(index);
                ReconcileOutcome::Removed { index }
            }
            None => ReconcileOutcome::Ignored,
        }
    }

    /// Apply events in order.
    pub fn apply_events(
        &mut self,
        events: &[TimelineEvent],
    ) -> Result<Vec<ReconcileOutcome>, TimelineMergeError> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            let outcome = match event {
                TimelineEvent::Confirmed(message) => self.on_confirmed(message.clone())?,
                TimelineEvent::Updated(message) => self.on_updated(message.clone())?,
                TimelineEvent::SendFailed { pending_id } => self.on_send_failed(pending_id),
                TimelineEvent::Deleted { message_id } => self.on_delete(message_id),
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Merge a page of older history (newest first) at the tail.
    ///
    /// Returns how many messages were added; IDs already resident are skipped.
    pub fn load_older(&mut self, page: Vec<Message>) -> Result<usize, TimelineMergeError> {
        for message in &page {
            self.ensure_conversation(message)?;
        }

        let mut added = 0;
        for message in page {
            if self.position(&message.id).is_some() {
                continue;
            }
            self.items.push(message);
            added += 1;
        }
        self.trim_to_max(0);
        Ok(added)
    }

    /// Clamp a requested page size against the configured cap.
    ///
    /// The result is always in `1..=100`.
    pub fn bounded_page_limit(requested: u16, cap: u16) -> u16 {
        let safe_requested = requested.max(1);
        let safe_cap = cap.max(1);
        safe_requested.min(safe_cap).min(100)
    }

    fn position(&self, message_id: &str) -> Option<usize> {
        self.items.iter().position(|message| message.id == message_id)
    }

    // Oldest match first, so identical sends confirm in send order.
    fn matching_placeholder(&self, confirmed: &Message) -> Option<usize> {
        let content = confirmed.content.trim();
        self.items.iter().rposition(|candidate| {
            candidate.is_pending()
                && candidate.sender_id == confirmed.sender_id
                && candidate.content.trim() == content
                && candidate.reply_key() == confirmed.reply_key()
        })
    }

    fn has_pending_from(&self, sender_id: &str) -> bool {
        self.items
            .iter()
            .any(|message| message.is_pending() && message.sender_id == sender_id)
    }

    fn ensure_conversation(&self, message: &Message) -> Result<(), TimelineMergeError> {
        if message.conversation_id == self.conversation_id {
            return Ok(());
        }
        Err(TimelineMergeError::ConversationMismatch {
            message_id: message.id.clone(),
            expected: self.conversation_id.clone(),
            actual: message.conversation_id.clone(),
        })
    }

    // Placeholders and the first `keep_head` entries are never trimmed, so
    // the cap can be exceeded while sends are in flight.
    fn trim_to_max(&mut self, keep_head: usize) {
        while self.items.len() > self.max_items {
            let Some(index) = self
                .items
                .iter()
                .rposition(|message| !message.is_pending())
                .filter(|index| *index >= keep_head)
            else {
                break;
            };
            self.items.remove(index);
        }
    }
}
