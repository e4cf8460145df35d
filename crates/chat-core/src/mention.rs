//! `@mention` composition: picker trigger detection and tracked offset ranges.
//!
//! Offsets are byte offsets into the composition text.

use tracing::trace;

use crate::types::MentionRange;

/// User picked from the mention picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionCandidate {
    /// User ID bound to the mention.
    pub user_id: String,
    /// Text inserted into the composition, for example `@John`.
    pub display: String,
}

impl MentionCandidate {
    pub fn new(user_id: impl Into<String>, display: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display: display.into(),
        }
    }
}

/// Open `@` token before the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionQuery {
    /// Offset of the `@`.
    pub start: usize,
    /// Text between the `@` and the cursor, used as the picker filter.
    pub query: String,
}

/// Detect an unterminated `@` token ending at `cursor`.
///
/// Whitespace between the `@` and the cursor closes the token.
pub fn active_mention_query(text: &str, cursor: usize) -> Option<MentionQuery> {
    let cursor = cursor.min(text.len());
    let before = text.get(..cursor)?;
    let start = before.rfind('@')?;
    let query = &before[start + 1..];
    if query.chars().any(char::is_whitespace) {
        return None;
    }
    Some(MentionQuery {
        start,
        query: query.to_owned(),
    })
}

/// Tracks mention ranges for one composition.
#[derive(Debug, Clone, Default)]
pub struct MentionIndexer {
    text: String,
    ranges: Vec<MentionRange>,
}

impl MentionIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Composition text as last seen.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Tracked ranges, ordered by start offset.
    pub fn ranges(&self) -> &[MentionRange] {
        &self.ranges
    }

    /// Picker query for the current text at `cursor`.
    pub fn query(&self, cursor: usize) -> Option<MentionQuery> {
        active_mention_query(&self.text, cursor)
    }

    /// Replace the open `@` token at the end of `text` with `candidate`.
    pub fn insert_mention(&mut self, text: &str, candidate: &MentionCandidate) -> String {
        self.insert_mention_at(text, text.len(), candidate)
    }

    /// Replace the open `@` token ending at `cursor` with `candidate`.
    ///
    /// Without an open token the mention is inserted at the cursor. A single
    /// space follows the mention unless whitespace already does.
    pub fn insert_mention_at(
        &mut self,
        text: &str,
        cursor: usize,
        candidate: &MentionCandidate,
    ) -> String {
        self.on_text_changed(text);

        let mut cursor = cursor.min(text.len());
        while !text.is_char_boundary(cursor) {
            cursor -= 1;
        }
        let start = active_mention_query(text, cursor)
            .map(|query| query.start)
            .unwrap_or(cursor);

        let rest = &text[cursor..];
        let mut inserted = candidate.display.clone();
        if !rest.starts_with(char::is_whitespace) {
            inserted.push(' ');
        }

        let new_text = format!("{}{}{}", &text[..start], inserted, rest);
        let delta = inserted.len() as isize - (cursor - start) as isize;

        self.ranges.retain(|range| !splits(range, start, cursor));
        for range in &mut self.ranges {
            if range.start >= cursor {
                range.start = range.start.saturating_add_signed(delta);
                range.end = range.end.saturating_add_signed(delta);
            }
        }

        let end = start + candidate.display.len();
        self.ranges.retain(|range| !range.intersects(start, end));
        self.ranges.push(MentionRange {
            user_id: candidate.user_id.clone(),
            display: candidate.display.clone(),
            start,
            end,
        });
        self.ranges.sort_by_key(|range| range.start);

        trace!(
            user_id = %candidate.user_id,
            start,
            end,
            tracked = self.ranges.len(),
            "mention inserted"
        );
        self.text = new_text.clone();
        new_text
    }

    /// Re-base tracked ranges onto `new_text` and drop the ones that no
    /// longer spell their display text.
    pub fn on_text_changed(&mut self, new_text: &str) {
        if self.text == new_text {
            return;
        }

        let old_len = self.text.len();
        let suffix = common_suffix_len(&self.text, new_text);
        let edit_end = old_len - suffix;
        let prefix = common_prefix_len(
            &self.text[..edit_end],
            &new_text[..new_text.len() - suffix],
        );
        let delta = new_text.len() as isize - old_len as isize;

        // The edited region is `prefix..edit_end` of the old text.
        let before = self.ranges.len();
        self.ranges.retain(|range| !splits(range, prefix, edit_end));

        for range in &mut self.ranges {
            if range.start >= edit_end {
                range.start = range.start.saturating_add_signed(delta);
                range.end = range.end.saturating_add_signed(delta);
            }
        }

        self.ranges.retain(|range| is_valid(range, new_text));
        if self.ranges.len() != before {
            trace!(
                dropped = before - self.ranges.len(),
                "mention ranges invalidated by edit"
            );
        }
        self.text = new_text.to_owned();
    }

    /// Valid ranges for `text`, used to populate an outgoing message.
    pub fn extract_ranges(&mut self, text: &str) -> Vec<MentionRange> {
        self.on_text_changed(text);
        self.ranges.clone()
    }

    /// Forget text and ranges, for example after a send.
    pub fn clear(&mut self) {
        self.text.clear();
        self.ranges.clear();
    }
}

fn is_valid(range: &MentionRange, text: &str) -> bool {
    text.get(range.start..range.end) == Some(range.display.as_str())
}

// Replacing `start..end` cuts through the range, or inserts strictly inside it.
fn splits(range: &MentionRange, start: usize, end: usize) -> bool {
    if start == end {
        return range.start < start && start < range.end;
    }
    range.intersects(start, end)
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, left), right)| left != right)
        .map(|((index, _), _)| index)
        .unwrap_or_else(|| a.len().min(b.len()))
}

fn common_suffix_len(a: &str, b: &str) -> usize {
    a.chars()
        .rev()
        .zip(b.chars().rev())
        .take_while(|(left, right)| left == right)
        .map(|(left, _)| left.len_utf8())
        .sum()
}
