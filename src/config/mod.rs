//! TOML configuration.
//!
//! Everything has a default so `voxloop` runs with no config file at
//! all (echo engine, mock providers, in-memory history).

pub mod schema;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use schema::parse_duration;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub conversation: ConversationConfig,
    pub history: HistoryConfig,
    pub agent: AgentConfig,
    pub tts: TtsConfig,
    pub stt: SttConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address for the WebSocket server.
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConversationConfig {
    /// Default display name for assistants (overridable per connection).
    pub assistant_name: String,
    pub system_prompt: String,
    /// Synthetic input used for proactive turns.
    pub proactive_prompt: String,
    pub thinking_placeholder: String,
    /// Bound on the wait for playback confirmation, e.g. `"60s"`.
    pub playback_wait: String,
    /// Maximum concurrent TTS syntheses per turn.
    pub tts_concurrency: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            assistant_name: "Bot".to_string(),
            system_prompt: "You are a friendly voice assistant. Keep responses short and conversational.".to_string(),
            proactive_prompt: "Please say something.".to_string(),
            thinking_placeholder: "Thinking...".to_string(),
            playback_wait: "60s".to_string(),
            tts_concurrency: 3,
        }
    }
}

impl ConversationConfig {
    pub fn playback_wait_duration(&self) -> Result<Duration> {
        parse_duration(&self.playback_wait)
            .map_err(|e| anyhow::anyhow!("invalid conversation.playback_wait: {e}"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    /// `memory` or `file`.
    pub mode: String,
    /// Directory for per-client history files (`file` mode).
    pub data_dir: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            mode: "memory".to_string(),
            data_dir: "./history".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// `echo` or `openai`.
    pub provider: String,
    pub openai: OpenAiAgentConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: "echo".to_string(),
            openai: OpenAiAgentConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenAiAgentConfig {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key, if any.
    pub api_key_env: Option<String>,
}

impl Default for OpenAiAgentConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434/v1".to_string(),
            model: "llama3".to_string(),
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TtsConfig {
    /// `mock` or `voicevox`.
    pub provider: String,
    pub voicevox: VoicevoxTtsConfig,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            voicevox: VoicevoxTtsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VoicevoxTtsConfig {
    pub base_url: String,
    pub speaker_id: i64,
    pub speed: f64,
}

impl Default for VoicevoxTtsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:50021".to_string(),
            speaker_id: 1,
            speed: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SttConfig {
    /// Only `mock` is built in; real engines are external collaborators.
    pub provider: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.server.listen, "127.0.0.1:8090");
        assert_eq!(config.agent.provider, "echo");
        assert_eq!(
            config.conversation.playback_wait_duration().unwrap(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [conversation]
            assistant_name = "Aria"
            playback_wait = "30s"

            [tts]
            provider = "voicevox"
            "#,
        )
        .unwrap();
        assert_eq!(config.conversation.assistant_name, "Aria");
        assert_eq!(
            config.conversation.playback_wait_duration().unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(config.tts.provider, "voicevox");
        // Untouched sections keep their defaults.
        assert_eq!(config.agent.provider, "echo");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Config, _> = toml::from_str("[conversation]\nbogus = 1\n");
        assert!(result.is_err());
    }

    #[test]
    fn bad_duration_is_an_error() {
        let config: Config = toml::from_str("[conversation]\nplayback_wait = \"soon\"\n").unwrap();
        assert!(config.conversation.playback_wait_duration().is_err());
    }
}
