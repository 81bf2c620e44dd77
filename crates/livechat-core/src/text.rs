// Whitespace normalization and word-boundary truncation for user text.

/// Word cap for chat messages.
pub const MAX_MESSAGE_WORDS: usize = 50;

/// Word cap for feedback comments.
pub const MAX_COMMENT_WORDS: usize = 150;

/// Collapse every whitespace run to a single space and trim the ends.
pub fn normalize_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize whitespace and keep only the first `max_words` words.
pub fn truncate_to_max_words(raw: &str, max_words: usize) -> String {
    raw.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when the text has no words at all.
pub fn is_blank(raw: &str) -> bool {
    raw.split_whitespace().next().is_none()
}
