//! Bounding error messages before they reach the ledger.
//!
//! Handler errors can embed whole stack traces or response bodies. Middle
//! omission keeps the head (what failed) and the tail (the root cause in an
//! `anyhow` chain) of the message.

/// Shorten `message` to at most `max_chars` characters, replacing the middle
/// with a marker that says how much was dropped. The marker counts against
/// the bound.
pub fn truncate_error(message: &str, max_chars: usize) -> String {
    let total = message.chars().count();
    if total <= max_chars {
        return message.to_owned();
    }

    // The omitted count never exceeds `total`, so this marker is the widest.
    let keep = max_chars.saturating_sub(marker(total).chars().count());
    if keep == 0 {
        return message.chars().take(max_chars).collect();
    }

    let tail_len = keep / 2;
    let head_end = byte_offset(message, keep - tail_len);
    let tail_start = byte_offset(message, total - tail_len);
    format!(
        "{}{}{}",
        &message[..head_end],
        marker(total - keep),
        &message[tail_start..]
    )
}

fn marker(omitted: usize) -> String {
    format!(" [...{omitted} chars omitted...] ")
}

/// Byte index of the `n`th character, or the end of `s`.
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map_or(s.len(), |(i, _)| i)
}
