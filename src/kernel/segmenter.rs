//! Splits long text into synthesis-sized units at natural boundaries.
//!
//! Break points are searched backwards inside `[0.8 * max_len, max_len]`
//! (in characters), in priority order: paragraph break, sentence end,
//! clause punctuation, any whitespace, and finally a hard cut.

use super::segment::{Segment, SegmentId};

const MIN_BREAK_RATIO: f64 = 0.8;

/// Split `text` into trimmed, non-empty segments of at most `max_len` characters.
pub fn segment(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        while start < chars.len() && chars[start].is_whitespace() {
            start += 1;
        }
        if start >= chars.len() {
            break;
        }

        let rest = &chars[start..];
        if rest.len() <= max_len {
            push_trimmed(&mut out, rest);
            break;
        }

        let cut = find_break(rest, max_len);
        push_trimmed(&mut out, &rest[..cut]);
        start += cut;
    }

    out
}

/// Build the ordered segment list for a session.
pub fn build_segments(text: &str, max_len: usize) -> Vec<Segment> {
    segment(text, max_len)
        .into_iter()
        .enumerate()
        .map(|(i, text)| Segment::new(SegmentId(i), text))
        .collect()
}

/// Trailing slice of `previous` (at most `max_chars` characters, starting on a
/// word boundary) carried into the next request for prosodic continuity.
pub fn context_tail(previous: &str, max_chars: usize) -> Option<String> {
    if max_chars == 0 {
        return None;
    }
    let chars: Vec<char> = previous.trim().chars().collect();
    if chars.is_empty() {
        return None;
    }
    if chars.len() <= max_chars {
        return Some(chars.into_iter().collect());
    }

    let mut from = chars.len() - max_chars;
    // Don't start mid-word unless the tail has no whitespace at all
    if !chars[from - 1].is_whitespace() {
        if let Some(ws) = chars[from..].iter().position(|c| c.is_whitespace()) {
            from += ws;
        }
    }

    let tail: String = chars[from..].iter().collect();
    let tail = tail.trim();
    if tail.is_empty() {
        None
    } else {
        Some(tail.to_string())
    }
}

/// Returns the exclusive cut offset into `rest` (`rest.len() > max_len`).
fn find_break(rest: &[char], max_len: usize) -> usize {
    let min = ((max_len as f64 * MIN_BREAK_RATIO).ceil() as usize).clamp(1, max_len);
    let at = |i: usize| rest.get(i).copied();
    let followed_by_ws = |i: usize| at(i + 1).map_or(false, char::is_whitespace);

    // 1. Paragraph break: cut before the blank line
    for i in (min..=max_len).rev() {
        if at(i) == Some('\n') && at(i + 1) == Some('\n') {
            return i;
        }
    }

    // 2. Sentence end, keep the punctuation with the segment
    for i in (min - 1..max_len).rev() {
        if matches!(rest[i], '.' | '!' | '?') && followed_by_ws(i) {
            return i + 1;
        }
    }

    // 3. Clause punctuation
    for i in (min - 1..max_len).rev() {
        if matches!(rest[i], ',' | ';') && followed_by_ws(i) {
            return i + 1;
        }
    }

    // 4. Any whitespace
    for i in (min..=max_len).rev() {
        if at(i).map_or(false, char::is_whitespace) {
            return i;
        }
    }

    // 5. Hard cut
    max_len
}

fn push_trimmed(out: &mut Vec<String>, chars: &[char]) {
    let s: String = chars.iter().collect();
    let trimmed = s.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}
