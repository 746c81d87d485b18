//! VOICEVOX-compatible REST TTS provider.
//!
//! Two-step protocol: `POST /audio_query` builds synthesis parameters for
//! the text, `POST /synthesis` renders them to WAV. AivisSpeech and other
//! VOICEVOX-family engines expose the same API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::provider::{TtsProvider, TtsResult};

#[derive(Debug, Clone)]
pub struct VoicevoxConfig {
    /// Engine base URL, e.g. `http://127.0.0.1:50021`.
    pub base_url: String,
    /// Engine speaker/style id.
    pub speaker_id: i64,
    /// Playback speed multiplier.
    pub speed: f64,
}

impl Default for VoicevoxConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:50021".to_string(),
            speaker_id: 1,
            speed: 1.0,
        }
    }
}

/// Fields of the audio query we adjust or read back.
#[derive(Debug, Deserialize)]
struct AudioQueryMeta {
    #[serde(rename = "outputSamplingRate")]
    output_sampling_rate: u32,
}

pub struct VoicevoxProvider {
    http: reqwest::Client,
    config: VoicevoxConfig,
}

impl VoicevoxProvider {
    pub fn new(config: VoicevoxConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl TtsProvider for VoicevoxProvider {
    async fn synthesize(&self, text: &str) -> Result<TtsResult> {
        let base = self.config.base_url.trim_end_matches('/');

        let speaker = self.config.speaker_id.to_string();
        let mut query: serde_json::Value = self
            .http
            .post(format!("{base}/audio_query"))
            .query(&[("text", text), ("speaker", speaker.as_str())])
            .send()
            .await
            .context("audio_query request failed")?
            .error_for_status()
            .context("audio_query returned an error status")?
            .json()
            .await
            .context("audio_query returned invalid JSON")?;

        query["speedScale"] = serde_json::json!(self.config.speed);

        let meta: AudioQueryMeta =
            serde_json::from_value(query.clone()).context("audio_query missing sampling rate")?;

        let audio = self
            .http
            .post(format!("{base}/synthesis"))
            .query(&[("speaker", speaker.as_str())])
            .json(&query)
            .send()
            .await
            .context("synthesis request failed")?
            .error_for_status()
            .context("synthesis returned an error status")?
            .bytes()
            .await
            .context("synthesis body read failed")?;

        // 16-bit mono WAV: duration from payload size past the 44-byte header.
        let pcm_bytes = audio.len().saturating_sub(44) as f64;
        let duration_ms = pcm_bytes / 2.0 / meta.output_sampling_rate as f64 * 1000.0;

        debug!(
            chars = text.chars().count(),
            bytes = audio.len(),
            duration_ms,
            "voicevox synthesis complete"
        );

        Ok(TtsResult {
            audio: audio.to_vec(),
            format: "wav".to_string(),
            duration_ms,
        })
    }

    fn name(&self) -> &str {
        "voicevox"
    }
}
