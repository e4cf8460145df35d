//! Interleaves day and unread dividers into a newest-first message list.

use chrono::{Local, NaiveDate, TimeZone};
use tracing::{debug, warn};

use crate::types::{Message, ReadWatermark, RenderItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnreadAnchor {
    /// Directly before the watermark message at this index.
    BeforeMessage(usize),
    /// Directly after the oldest unread message at this index.
    AfterMessage(usize),
    /// After the oldest resident message.
    OldestEnd,
}

/// Compose the render sequence using the host's local time zone.
pub fn compose(
    messages: &[Message],
    unread_count: usize,
    watermark: Option<&ReadWatermark>,
) -> Vec<RenderItem> {
    compose_in(&Local, messages, unread_count, watermark)
}

/// Compose the render sequence, comparing calendar days in `tz`.
///
/// `messages` is newest first and so is the output. A day divider sits
/// between two adjacent messages on different calendar days and carries the
/// older message's day. The unread divider is only emitted when
/// `unread_count > 0`.
pub fn compose_in<Tz: TimeZone>(
    tz: &Tz,
    messages: &[Message],
    unread_count: usize,
    watermark: Option<&ReadWatermark>,
) -> Vec<RenderItem> {
    let anchor = (unread_count > 0).then(|| locate_unread_anchor(messages, watermark));
    let unread_divider = RenderItem::UnreadDivider {
        count: unread_count,
    };

    let mut items = Vec::with_capacity(messages.len() + 4);
    for (index, message) in messages.iter().enumerate() {
        if anchor == Some(UnreadAnchor::BeforeMessage(index)) {
            items.push(unread_divider.clone());
        }
        items.push(RenderItem::Message(message.clone()));
        if anchor == Some(UnreadAnchor::AfterMessage(index)) {
            items.push(unread_divider.clone());
        }

        if let Some(older) = messages.get(index + 1) {
            let older_day = local_day(tz, older);
            if local_day(tz, message) != older_day {
                items.push(RenderItem::DayDivider { date: older_day });
            }
        }
    }

    if anchor == Some(UnreadAnchor::OldestEnd) {
        items.push(unread_divider);
    }
    items
}

fn local_day<Tz: TimeZone>(tz: &Tz, message: &Message) -> NaiveDate {
    message.created_at.with_timezone(tz).date_naive()
}

fn locate_unread_anchor(messages: &[Message], watermark: Option<&ReadWatermark>) -> UnreadAnchor {
    let Some(watermark) = watermark else {
        return UnreadAnchor::OldestEnd;
    };

    if let Some(index) = messages
        .iter()
        .position(|message| message.id == watermark.last_read_message_id)
    {
        return UnreadAnchor::BeforeMessage(index);
    }

    // Watermark message is outside the loaded window.
    match messages
        .iter()
        .rposition(|message| message.created_at > watermark.last_read_at)
    {
        Some(index) => {
            debug!(
                watermark_id = %watermark.last_read_message_id,
                index,
                "unread divider placed by timestamp"
            );
            UnreadAnchor::AfterMessage(index)
        }
        None => {
            warn!(
                watermark_id = %watermark.last_read_message_id,
                "no resident message is newer than the watermark; unread divider placed at oldest end"
            );
            UnreadAnchor::OldestEnd
        }
    }
}
