//! Unread and mention arithmetic over a read watermark.
//!
//! All comparisons are by `created_at`, never by list position, because the
//! watermark message is often not resident in the loaded window.

use chrono::{DateTime, Utc};

use crate::types::{Message, ReadWatermark};

/// Watermark timestamp, when a watermark exists.
pub fn read_since(watermark: Option<&ReadWatermark>) -> Option<DateTime<Utc>> {
    watermark.map(|watermark| watermark.last_read_at)
}

fn is_after(message: &Message, since: Option<DateTime<Utc>>) -> bool {
    since.is_none_or(|since| message.created_at > since)
}

/// Messages newer than `since` that `user_id` did not author.
pub fn unread_messages<'a>(
    messages: &'a [Message],
    since: Option<DateTime<Utc>>,
    user_id: &'a str,
) -> impl Iterator<Item = &'a Message> + 'a {
    messages
        .iter()
        .filter(move |message| message.sender_id != user_id && is_after(message, since))
}

/// Unread count for `user_id` given the watermark timestamp.
pub fn count_unread(messages: &[Message], since: Option<DateTime<Utc>>, user_id: &str) -> u64 {
    unread_messages(messages, since, user_id).count() as u64
}

/// Messages newer than `since` carrying a mention of `user_id`.
///
/// Self-authored messages are not excluded.
pub fn unread_mentions<'a>(
    messages: &'a [Message],
    since: Option<DateTime<Utc>>,
    user_id: &'a str,
) -> impl Iterator<Item = &'a Message> + 'a {
    messages
        .iter()
        .filter(move |message| is_after(message, since) && message.mentions_user(user_id))
}

pub fn has_unread_mention(
    messages: &[Message],
    since: Option<DateTime<Utc>>,
    user_id: &str,
) -> bool {
    unread_mentions(messages, since, user_id).next().is_some()
}

/// Most recent unread mention of `user_id`, for "jump to mention".
pub fn latest_unread_mention_id<'a>(
    messages: &'a [Message],
    since: Option<DateTime<Utc>>,
    user_id: &'a str,
) -> Option<&'a str> {
    unread_mentions(messages, since, user_id)
        .max_by_key(|message| message.created_at)
        .map(|message| message.id.as_str())
}

/// Whether a watermark may move to a message created at `target_at`.
///
/// Read state never regresses; an equal timestamp is allowed.
pub fn should_advance(current: Option<&ReadWatermark>, target_at: DateTime<Utc>) -> bool {
    current.is_none_or(|current| current.allows_advance_to(target_at))
}
