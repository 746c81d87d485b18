//! Mock STT provider for testing.
//!
//! Replays a configured transcript queue, one entry per `transcribe`
//! call, falling back to a fixed default when the queue runs dry.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::sleep;

use crate::provider::SttProvider;

/// Mock STT provider.
pub struct MockSttProvider {
    transcripts: Mutex<Vec<String>>,
    fallback: String,
    latency: Duration,
}

impl MockSttProvider {
    pub fn new(transcripts: Vec<String>) -> Self {
        Self {
            transcripts: Mutex::new(transcripts),
            fallback: String::new(),
            latency: Duration::ZERO,
        }
    }

    /// Always transcribe to `text`.
    pub fn fixed(text: &str) -> Self {
        Self {
            transcripts: Mutex::new(Vec::new()),
            fallback: text.to_string(),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, ms: u64) -> Self {
        self.latency = Duration::from_millis(ms);
        self
    }
}

#[async_trait]
impl SttProvider for MockSttProvider {
    async fn transcribe(&self, _audio: &[u8]) -> Result<String> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        let mut queue = self.transcripts.lock().expect("transcripts lock");
        if queue.is_empty() {
            Ok(self.fallback.clone())
        } else {
            Ok(queue.remove(0))
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}
