//! Mock TTS provider for testing.
//!
//! Generates deterministic byte buffers whose size tracks input length.
//! Latency is configurable globally and per-text, which lets tests force
//! out-of-order synthesis completion; failure injection lets them
//! exercise the sentinel path.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::sleep;

use crate::provider::{TtsProvider, TtsResult};

/// Configuration for [`MockTtsProvider`].
#[derive(Debug, Clone)]
pub struct MockTtsConfig {
    pub ms_per_char: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    /// Baseline synthesis latency.
    pub latency: Duration,
    /// Per-text latency overrides.
    pub latency_overrides: HashMap<String, Duration>,
    /// Texts containing any of these substrings fail to synthesize.
    pub fail_on: Vec<String>,
}

impl Default for MockTtsConfig {
    fn default() -> Self {
        Self {
            ms_per_char: 150.0,
            min_duration_ms: 200.0,
            max_duration_ms: 30000.0,
            latency: Duration::ZERO,
            latency_overrides: HashMap::new(),
            fail_on: Vec::new(),
        }
    }
}

/// Mock TTS provider that produces deterministic audio bytes.
pub struct MockTtsProvider {
    config: MockTtsConfig,
}

impl MockTtsProvider {
    pub fn new(config: MockTtsConfig) -> Self {
        Self { config }
    }

    /// Zero-latency provider with default settings.
    pub fn instant() -> Self {
        Self::new(MockTtsConfig::default())
    }

    /// Uniform synthesis latency.
    pub fn with_latency(ms: u64) -> Self {
        Self::new(MockTtsConfig {
            latency: Duration::from_millis(ms),
            ..Default::default()
        })
    }

    /// Per-text latencies, e.g. `[("A", 300), ("B", 50)]`.
    pub fn with_latency_map(entries: &[(&str, u64)]) -> Self {
        Self::new(MockTtsConfig {
            latency_overrides: entries
                .iter()
                .map(|(text, ms)| (text.to_string(), Duration::from_millis(*ms)))
                .collect(),
            ..Default::default()
        })
    }

    /// Fail synthesis for texts containing `needle`.
    pub fn failing_on(needle: &str) -> Self {
        Self::new(MockTtsConfig {
            fail_on: vec![needle.to_string()],
            ..Default::default()
        })
    }
}

#[async_trait]
impl TtsProvider for MockTtsProvider {
    async fn synthesize(&self, text: &str) -> Result<TtsResult> {
        let latency = self
            .config
            .latency_overrides
            .get(text)
            .copied()
            .unwrap_or(self.config.latency);
        if !latency.is_zero() {
            sleep(latency).await;
        }

        if self.config.fail_on.iter().any(|n| text.contains(n)) {
            anyhow::bail!("mock synthesis failure for {text:?}");
        }

        let char_count = text.chars().count() as f64;
        let duration_ms = (char_count * self.config.ms_per_char)
            .clamp(self.config.min_duration_ms, self.config.max_duration_ms);

        // One byte per simulated millisecond keeps sizes proportional and
        // cheap to assert on.
        let audio = vec![0u8; duration_ms as usize];

        Ok(TtsResult {
            audio,
            format: "raw".to_string(),
            duration_ms,
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
