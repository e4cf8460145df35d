use std::collections::HashSet;

use chat_core::{
    ConversationEvent, Message, RenderItem, SendAck, SessionLifecycleState, TypingPresence,
};
use chrono::NaiveDate;
use tracing::{debug, trace, warn};

/// Printable row of the conversation view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowView {
    Message {
        message_id: String,
        sender: String,
        body: String,
        is_own: bool,
        is_pending: bool,
        is_edited: bool,
    },
    Day {
        date: NaiveDate,
    },
    Unread {
        count: usize,
    },
}

impl RowView {
    fn from_item(item: &RenderItem, own_user_id: &str) -> Self {
        match item {
            RenderItem::Message(message) => message_row(message, own_user_id),
            RenderItem::DayDivider { date } => Self::Day { date: *date },
            RenderItem::UnreadDivider { count } => Self::Unread { count: *count },
        }
    }

    /// Single console line for this row.
    pub fn render_line(&self) -> String {
        match self {
            Self::Message {
                sender,
                body,
                is_own,
                is_pending,
                is_edited,
                ..
            } => {
                let who = if *is_own { "you" } else { sender.as_str() };
                let mut line = format!("  {who}: {body}");
                if *is_edited {
                    line.push_str(" (edited)");
                }
                if *is_pending {
                    line.push_str(" [sending]");
                }
                line
            }
            Self::Day { date } => format!("----- {} -----", date.format("%a %d %b %Y")),
            Self::Unread { count } => format!("===== {count} unread ====="),
        }
    }
}

/// Snapshot consumed by the console printer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleSnapshot {
    pub conversation_id: Option<String>,
    pub status_text: String,
    pub error_text: Option<String>,
    /// Rows newest first, as composed by the runtime.
    pub rows: Vec<RowView>,
    pub unread_count: u64,
    pub has_unread_mention: bool,
    pub typing_text: Option<String>,
    pub pending_send_count: usize,
}

/// Reducer from runtime events to printable view state.
#[derive(Debug, Clone)]
pub struct ConsoleState {
    own_user_id: String,
    conversation_id: Option<String>,
    status_text: String,
    error_text: Option<String>,
    rows: Vec<RowView>,
    unread_count: u64,
    latest_unread_mention_id: Option<String>,
    typing_text: Option<String>,
    pending_sends: HashSet<String>,
}

impl ConsoleState {
    pub fn new(own_user_id: impl Into<String>) -> Self {
        Self {
            own_user_id: own_user_id.into(),
            conversation_id: None,
            status_text: lifecycle_label(SessionLifecycleState::Idle).to_owned(),
            error_text: None,
            rows: Vec::new(),
            unread_count: 0,
            latest_unread_mention_id: None,
            typing_text: None,
            pending_sends: HashSet::new(),
        }
    }

    pub fn snapshot(&self) -> ConsoleSnapshot {
        ConsoleSnapshot {
            conversation_id: self.conversation_id.clone(),
            status_text: self.status_text.clone(),
            error_text: self.error_text.clone(),
            rows: self.rows.clone(),
            unread_count: self.unread_count,
            has_unread_mention: self.latest_unread_mention_id.is_some(),
            typing_text: self.typing_text.clone(),
            pending_send_count: self.pending_sends.len(),
        }
    }

    /// Newest message row, used to pick a mark-read target.
    pub fn newest_message_id(&self) -> Option<&str> {
        self.rows.iter().find_map(|row| match row {
            RowView::Message {
                message_id,
                is_pending: false,
                ..
            } => Some(message_id.as_str()),
            _ => None,
        })
    }

    pub fn mark_send_requested(&mut self, client_txn_id: impl Into<String>) {
        self.pending_sends.insert(client_txn_id.into());
    }

    pub fn clear_error(&mut self) {
        self.error_text = None;
    }

    pub fn handle_send_ack(&mut self, ack: SendAck) {
        self.pending_sends.remove(&ack.client_txn_id);
        if let Some(error_code) = ack.error_code {
            warn!(
                client_txn_id = %ack.client_txn_id,
                error_code = %error_code,
                "send acknowledgement reported failure"
            );
            self.error_text = Some(format!("send failed ({error_code})"));
        } else {
            debug!(client_txn_id = %ack.client_txn_id, "send acknowledgement succeeded");
            self.clear_error();
        }
    }

    /// Feed one runtime event into the reducer.
    pub fn handle_event(&mut self, event: ConversationEvent) {
        match event {
            ConversationEvent::StateChanged { state } => {
                self.status_text = lifecycle_label(state).to_owned();
                if matches!(
                    state,
                    SessionLifecycleState::Opening | SessionLifecycleState::Closed
                ) {
                    self.rows.clear();
                    self.typing_text = None;
                    self.unread_count = 0;
                    self.latest_unread_mention_id = None;
                }
            }
            ConversationEvent::TimelineUpdated {
                conversation_id,
                items,
                unread_count,
                latest_unread_mention_id,
            } => {
                trace!(
                    %conversation_id,
                    item_count = items.len(),
                    unread_count,
                    "received timeline update"
                );
                self.rows = items
                    .iter()
                    .map(|item| RowView::from_item(item, &self.own_user_id))
                    .collect();
                self.unread_count = unread_count;
                self.latest_unread_mention_id = latest_unread_mention_id;
                self.conversation_id = Some(conversation_id);
            }
            ConversationEvent::TypingChanged { users, .. } => {
                self.typing_text = typing_line(&users);
            }
            ConversationEvent::SendAck(ack) => {
                self.handle_send_ack(ack);
            }
            ConversationEvent::FatalError {
                code,
                message,
                recoverable,
            } => {
                warn!(%code, %message, recoverable, "runtime error surfaced to state");
                if !recoverable {
                    self.status_text = "Error".to_owned();
                }
                self.error_text = Some(format!("{code}: {message}"));
            }
        }
    }
}

fn message_row(message: &Message, own_user_id: &str) -> RowView {
    RowView::Message {
        message_id: message.id.clone(),
        sender: message.sender_id.clone(),
        body: message.content.clone(),
        is_own: message.sender_id == own_user_id,
        is_pending: message.is_pending(),
        is_edited: message.updated_at.is_some(),
    }
}

fn lifecycle_label(state: SessionLifecycleState) -> &'static str {
    match state {
        SessionLifecycleState::Idle => "Idle",
        SessionLifecycleState::Opening => "Opening",
        SessionLifecycleState::Active => "Active",
        SessionLifecycleState::Closed => "Closed",
    }
}

fn typing_line(users: &[TypingPresence]) -> Option<String> {
    match users {
        [] => None,
        [one] => Some(format!("{} is typing...", one.user_name)),
        [first, second] => Some(format!(
            "{} and {} are typing...",
            first.user_name, second.user_name
        )),
        _ => Some(format!("{} people are typing...", users.len())),
    }
}
