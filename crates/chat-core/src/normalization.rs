use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::ChatError,
    types::{ConversationEvent, MentionRange, Message, MessageKind, MessageStatus, SendAck},
};

/// Send result before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Send succeeded and produced a server message ID.
    Success { message_id: String },
    /// Send failed with error details.
    Failure { error: ChatError },
}

/// Convert a send outcome to a stable `ConversationEvent::SendAck`.
pub fn normalize_send_outcome(
    client_txn_id: impl Into<String>,
    outcome: SendOutcome,
) -> ConversationEvent {
    let client_txn_id = client_txn_id.into();
    match outcome {
        SendOutcome::Success { message_id } => ConversationEvent::SendAck(SendAck {
            client_txn_id,
            message_id: Some(message_id),
            error_code: None,
        }),
        SendOutcome::Failure { error } => ConversationEvent::SendAck(SendAck {
            client_txn_id,
            message_id: None,
            error_code: Some(error.code),
        }),
    }
}

/// Convert an error into a `FatalError` event.
pub fn normalize_fatal_error(error: ChatError) -> ConversationEvent {
    let recoverable = error.is_recoverable();
    ConversationEvent::FatalError {
        code: error.code,
        message: error.message,
        recoverable,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MentionRecord {
    #[serde(alias = "userId")]
    user_id: Option<String>,
    display: Option<String>,
    start: Option<usize>,
    end: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MessageRecord {
    id: Option<Value>,
    #[serde(alias = "conversationId", alias = "channel_id", alias = "channelId")]
    conversation_id: Option<String>,
    #[serde(alias = "senderId", alias = "user_id", alias = "userId")]
    sender_id: Option<String>,
    content: Option<String>,
    #[serde(alias = "createdAt")]
    created_at: Option<Value>,
    #[serde(alias = "updatedAt")]
    updated_at: Option<Value>,
    #[serde(alias = "replyToId", alias = "reply_to")]
    reply_to_id: Option<String>,
    mentions: Option<Vec<MentionRecord>>,
    #[serde(alias = "type")]
    kind: Option<String>,
    status: Option<String>,
}

/// Map a loosely-typed remote row or push payload to a [`Message`].
///
/// Accepts snake_case and camelCase keys, string or numeric IDs, and RFC 3339
/// or epoch-millisecond timestamps. Records without a status are treated as
/// `Sent`.
pub fn normalize_message_record(record: Value) -> Result<Message, ChatError> {
    let record: MessageRecord = serde_json::from_value(record)
        .map_err(|err| ChatError::malformed(format!("message record: {err}")))?;

    let id = record
        .id
        .as_ref()
        .and_then(id_from_value)
        .ok_or_else(|| ChatError::malformed("message record has no id"))?;
    let conversation_id = required(record.conversation_id, &id, "conversation_id")?;
    let sender_id = required(record.sender_id, &id, "sender_id")?;
    let created_at = record
        .created_at
        .as_ref()
        .and_then(timestamp_from_value)
        .ok_or_else(|| ChatError::malformed(format!("message '{id}' has no valid created_at")))?;
    let updated_at = record.updated_at.as_ref().and_then(timestamp_from_value);

    let kind = match record.kind.as_deref() {
        None => MessageKind::Text,
        Some(value) => MessageKind::from_wire(value).ok_or_else(|| {
            ChatError::malformed(format!("message '{id}' has unknown kind '{value}'"))
        })?,
    };
    let status = match record.status.as_deref() {
        None => MessageStatus::Sent,
        Some(value) => MessageStatus::from_wire(value).ok_or_else(|| {
            ChatError::malformed(format!("message '{id}' has unknown status '{value}'"))
        })?,
    };

    let content = record.content.unwrap_or_default();
    let mentions = record
        .mentions
        .unwrap_or_default()
        .into_iter()
        .map(|mention| mention_from_record(mention, &id))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Message {
        reply_to_id: record
            .reply_to_id
            .filter(|value| !value.trim().is_empty()),
        id,
        conversation_id,
        sender_id,
        content,
        created_at,
        updated_at,
        mentions,
        kind,
        status,
    })
}

fn required(value: Option<String>, id: &str, field: &str) -> Result<String, ChatError> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ChatError::malformed(format!("message '{id}' has no {field}")))
}

fn mention_from_record(record: MentionRecord, id: &str) -> Result<MentionRange, ChatError> {
    let (Some(user_id), Some(start), Some(end)) = (record.user_id, record.start, record.end) else {
        return Err(ChatError::malformed(format!(
            "message '{id}' has an incomplete mention"
        )));
    };
    if end < start {
        return Err(ChatError::malformed(format!(
            "message '{id}' has an inverted mention range {start}..{end}"
        )));
    }
    Ok(MentionRange {
        user_id,
        display: record.display.unwrap_or_default(),
        start,
        end,
    })
}

fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_owned()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Value::Number(millis) => millis.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}
