use std::sync::LazyLock;

use regex::Regex;

pub const MIN_INPUT_CHARS: usize = 1;
pub const MAX_INPUT_CHARS: usize = 1000;

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("static regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// Removes `<think>…</think>` reasoning blocks and collapses whitespace.
pub fn strip_reasoning(raw: &str) -> String {
    let without = THINK_BLOCK.replace_all(raw, "");
    WHITESPACE.replace_all(&without, " ").trim().to_string()
}

/// Accepts input whose trimmed length is within `MIN_INPUT_CHARS..=MAX_INPUT_CHARS` characters.
pub fn validate_user_input(input: &str) -> bool {
    let len = input.trim().chars().count();
    (MIN_INPUT_CHARS..=MAX_INPUT_CHARS).contains(&len)
}

/// Truncates to at most `max` characters, for log lines.
pub fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
