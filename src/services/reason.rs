/// Longest reason stored with a record, in characters.
pub const MAX_REASON_CHARS: usize = 1024;

const FENCE: &str = "```";

/// Joins the reason lines and truncates the result to [`MAX_REASON_CHARS`].
///
/// A truncated reason never ends up with an unbalanced code fence: if the cut
/// leaves an odd number of fences, the tail is replaced by a closing fence.
pub fn format_reason(lines: &[String]) -> String {
    truncate_reason(&lines.join("\n"))
}

pub fn truncate_reason(text: &str) -> String {
    if text.chars().count() <= MAX_REASON_CHARS {
        return text.to_string();
    }

    let cut = take_chars(text, MAX_REASON_CHARS);
    if fence_count(cut) % 2 == 0 {
        return cut.to_string();
    }

    // Appending a fence always adds exactly one to the count, even when the
    // trimmed text ends in backticks.
    let trimmed = take_chars(cut, MAX_REASON_CHARS - FENCE.len());
    if fence_count(trimmed) % 2 == 0 {
        trimmed.to_string()
    } else {
        format!("{trimmed}{FENCE}")
    }
}

pub fn fence_count(text: &str) -> usize {
    text.matches(FENCE).count()
}

fn take_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
