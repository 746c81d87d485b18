//! Sentence splitter for streaming engine output.
//!
//! Accumulates tokens and emits a [`SentenceOutput`] at sentence-ending
//! punctuation (`.?!` followed by whitespace, or CJK `。！？`) and at
//! paragraph breaks. Segments below a minimum length are held back and
//! merged forward; the remaining buffer is flushed when the stream ends.

use std::pin::Pin;

use anyhow::Result;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::SentenceOutput;

/// Delimiters that split immediately.
const CJK_DELIMITERS: &[char] = &['。', '！', '？'];

/// Delimiters that split only when followed by whitespace, so decimals
/// and abbreviations stay intact.
const ASCII_DELIMITERS: &[char] = &['.', '!', '?'];

/// Default minimum character length before a split is emitted.
const DEFAULT_MIN_CHARS: usize = 2;

/// Configurable sentence splitter.
pub struct SentenceSplitter {
    /// Minimum character count for a segment to be emitted on its own.
    pub min_chars: usize,
}

impl Default for SentenceSplitter {
    fn default() -> Self {
        Self {
            min_chars: DEFAULT_MIN_CHARS,
        }
    }
}

impl SentenceSplitter {
    pub fn new(min_chars: usize) -> Self {
        Self { min_chars }
    }

    /// Convert a token stream into a sentence stream.
    pub fn split(
        &self,
        token_stream: Pin<Box<dyn Stream<Item = Result<String>> + Send>>,
    ) -> Pin<Box<dyn Stream<Item = Result<SentenceOutput>> + Send>> {
        let min_chars = self.min_chars;
        let (tx, rx) = mpsc::channel::<Result<SentenceOutput>>(32);

        tokio::spawn(async move {
            let mut buffer = String::new();
            let mut stream = token_stream;

            while let Some(token_result) = stream.next().await {
                let token = match token_result {
                    Ok(t) => t,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                buffer.push_str(&token);

                loop {
                    let Some(pos) = split_position(&buffer) else {
                        break;
                    };
                    let sentence: String = buffer.drain(..pos).collect();
                    let trimmed = sentence.trim();
                    if trimmed.chars().count() >= min_chars {
                        if tx
                            .send(Ok(SentenceOutput::from_raw(trimmed)))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    } else if !trimmed.is_empty() {
                        // Below min_chars: merge forward with what follows.
                        let held = trimmed.to_string();
                        buffer.insert_str(0, &held);
                        break;
                    }
                }
            }

            let remaining = buffer.trim();
            if !remaining.is_empty() {
                let _ = tx.send(Ok(SentenceOutput::from_raw(remaining))).await;
            }
        });

        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
    }
}

/// Byte offset one past the first sentence boundary in `buffer`, if any.
fn split_position(buffer: &str) -> Option<usize> {
    // Paragraph break wins over punctuation if it comes first.
    let paragraph = buffer.find("\n\n");

    let mut chars = buffer.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if let Some(p) = paragraph {
            if i >= p {
                return Some(p + 2);
            }
        }
        if CJK_DELIMITERS.contains(&c) {
            return Some(i + c.len_utf8());
        }
        if ASCII_DELIMITERS.contains(&c) {
            // Split only at a whitespace boundary; buffer end may still
            // be mid-stream, so hold until the next token or final flush.
            if let Some((_, next)) = chars.peek() {
                if next.is_whitespace() {
                    return Some(i + c.len_utf8());
                }
            }
        }
    }
    paragraph.map(|p| p + 2)
}

/// Split a token stream using the default configuration.
pub fn split_into_sentences(
    token_stream: Pin<Box<dyn Stream<Item = Result<String>> + Send>>,
) -> Pin<Box<dyn Stream<Item = Result<SentenceOutput>> + Send>> {
    SentenceSplitter::default().split(token_stream)
}
