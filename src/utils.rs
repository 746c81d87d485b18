//! Small shared helpers.

use uuid::Uuid;

/// Truncate `s` to at most `max_bytes` bytes without splitting a
/// multi-byte character. Used for log previews of long responses.
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    // Cut before the first character that would cross the byte limit.
    match s
        .char_indices()
        .find(|(start, c)| start + c.len_utf8() > max_bytes)
    {
        Some((start, _)) => &s[..start],
        None => s,
    }
}

/// Short random tag for logs and session names (8 hex chars).
pub fn short_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_within_limit_is_identity() {
        assert_eq!(safe_truncate("hello", 10), "hello");
        assert_eq!(safe_truncate("hello", 5), "hello");
        assert_eq!(safe_truncate("", 10), "");
    }

    #[test]
    fn truncate_cuts_at_byte_limit() {
        assert_eq!(safe_truncate("hello world", 5), "hello");
        assert_eq!(safe_truncate("hello", 0), "");
    }

    #[test]
    fn truncate_never_splits_multibyte() {
        // Three 3-byte characters; a 7-byte cut backs up to 6.
        assert_eq!(safe_truncate("あいう", 7), "あい");
        assert_eq!(safe_truncate("あいう", 6), "あい");
    }

    #[test]
    fn short_id_is_eight_chars() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert_ne!(id, short_id());
    }
}
