//! STT / TTS provider traits and implementations.

pub mod stt;
pub mod tts;

use anyhow::Result;
use async_trait::async_trait;

// ── TTS ──────────────────────────────────────────────────────────

/// Result of a TTS synthesis call.
#[derive(Debug, Clone)]
pub struct TtsResult {
    /// Encoded audio bytes, ready for wire transfer.
    pub audio: Vec<u8>,
    /// Container format of `audio` (e.g. "wav").
    pub format: String,
    /// Duration in milliseconds.
    pub duration_ms: f64,
}

/// Text-to-speech provider.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Synthesize text into audio. Awaitable and cancel-safe: dropping the
    /// future must not leak transient resources.
    async fn synthesize(&self, text: &str) -> Result<TtsResult>;

    /// Human-readable provider name.
    fn name(&self) -> &str;

    /// Release resources.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// ── STT ──────────────────────────────────────────────────────────

/// Speech-to-text provider for captured utterances.
#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Transcribe one captured utterance. An empty transcript is valid.
    async fn transcribe(&self, audio: &[u8]) -> Result<String>;

    /// Human-readable provider name.
    fn name(&self) -> &str;

    /// Release resources.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
