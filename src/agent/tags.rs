//! Inline emotion/action tag extraction.
//!
//! Engines may emit avatar hints inline, e.g. `"[joy] Great to see you!"`.
//! Tags are stripped from the synthesized text (a TTS backend would read
//! them aloud) and surfaced as [`Actions`] for the client's avatar layer.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::protocol::Actions;

/// `[tag]` where tag is a short lowercase word (`[joy]`, `[sigh]`).
/// Bracketed numerals or multi-word stage directions are left alone.
static TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([a-z_]{1,24})\]").expect("tag pattern is valid"));

static WHITESPACE_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s{2,}").expect("whitespace pattern is valid"));

/// Result of extracting tags from one sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedSentence {
    pub display_text: String,
    pub tts_text: String,
    pub actions: Option<Actions>,
}

/// Strip `[tag]` markers from `text`, collecting them as actions.
///
/// Both display and TTS text lose the markers; they differ from the raw
/// input, not from each other, unless a future display policy changes.
pub fn extract(text: &str) -> TaggedSentence {
    let mut expressions = Vec::new();
    for capture in TAG_PATTERN.captures_iter(text) {
        expressions.push(capture[1].to_string());
    }

    let stripped = TAG_PATTERN.replace_all(text, " ");
    let collapsed = WHITESPACE_RUN.replace_all(stripped.trim(), " ").to_string();

    let actions = if expressions.is_empty() {
        None
    } else {
        Some(Actions { expressions })
    };

    TaggedSentence {
        display_text: collapsed.clone(),
        tts_text: collapsed,
        actions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_unchanged() {
        let t = extract("Hello world.");
        assert_eq!(t.display_text, "Hello world.");
        assert_eq!(t.tts_text, "Hello world.");
        assert!(t.actions.is_none());
    }

    #[test]
    fn leading_tag_stripped() {
        let t = extract("[joy] Hello!");
        assert_eq!(t.tts_text, "Hello!");
        assert_eq!(t.actions.unwrap().expressions, vec!["joy"]);
    }

    #[test]
    fn multiple_tags_collected_in_order() {
        let t = extract("[smile] I missed you. [wave]");
        assert_eq!(t.tts_text, "I missed you.");
        assert_eq!(t.actions.unwrap().expressions, vec!["smile", "wave"]);
    }

    #[test]
    fn mid_sentence_tag_collapses_whitespace() {
        let t = extract("Well [sigh] that happened.");
        assert_eq!(t.tts_text, "Well that happened.");
    }

    #[test]
    fn uppercase_brackets_are_not_tags() {
        let t = extract("[Interrupted by user]");
        assert_eq!(t.display_text, "[Interrupted by user]");
        assert!(t.actions.is_none());
    }

    #[test]
    fn bracketed_numbers_left_alone() {
        let t = extract("See citation [1].");
        assert_eq!(t.tts_text, "See citation [1].");
        assert!(t.actions.is_none());
    }
}
