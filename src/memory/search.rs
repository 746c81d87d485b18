//! History retrieval types and scoring.

use serde::{Deserialize, Serialize};

/// Minimum word length considered by the scorer; shorter words are noise.
const MIN_WORD_LEN: usize = 3;

/// A fragment of history content returned from retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryFragment {
    /// Where the fragment came from (store name).
    pub source: String,

    /// The history line itself.
    pub content: String,

    /// Relevance score (higher is better).
    pub score: f64,
}

impl MemoryFragment {
    /// Get a preview of the content (first `max_len` characters).
    pub fn preview(&self, max_len: usize) -> String {
        if self.content.chars().count() <= max_len {
            self.content.clone()
        } else {
            let truncated: String = self.content.chars().take(max_len).collect();
            format!("{truncated}...")
        }
    }
}

/// Score one history line against a query: the fraction of query words
/// (case-insensitive, length >= 3) that occur in the line.
pub fn score_line(line: &str, query: &str) -> f64 {
    let line_lower = line.to_lowercase();
    let words: Vec<&str> = query
        .split_whitespace()
        .filter(|w| w.chars().count() >= MIN_WORD_LEN)
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let hits = words
        .iter()
        .filter(|w| line_lower.contains(&w.to_lowercase()))
        .count();
    hits as f64 / words.len() as f64
}
