//! Output capping for model-bound tool results.
//!
//! Shell output keeps the tail (recent output is what matters); the cap is
//! bytes with a UTF-8-safe boundary and the truncation is always noted in
//! the returned text.

/// Keep at most `max_bytes` of the tail of `text`. If anything was dropped,
/// append a notice stating how much.
pub fn cap_tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut start = text.len() - max_bytes;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    // Prefer resuming at a line boundary when one is close by.
    let tail = &text[start..];
    let aligned = tail.find('\n').map(|p| &tail[p + 1..]).unwrap_or(tail);

    format!(
        "{}\n[Output truncated: kept last {} of {} bytes]",
        aligned,
        aligned.len(),
        text.len()
    )
}

/// Trailing-bytes slice with a UTF-8-safe start, no notice. Used by the
/// rolling process tails.
pub fn tail_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
