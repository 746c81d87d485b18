use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voxloop::agent::mock::EchoEngine;
use voxloop::agent::openai::{OpenAiConfig, OpenAiEngine};
use voxloop::agent::AgentEngine;
use voxloop::config::Config;
use voxloop::conversation::gate::ResponseGate;
use voxloop::conversation::handler::ConversationHandler;
use voxloop::conversation::{TurnDeps, TurnSettings};
use voxloop::memory::{FileHistory, HistoryStore, InMemoryHistory};
use voxloop::provider::stt::mock::MockSttProvider;
use voxloop::provider::tts::mock::MockTtsProvider;
use voxloop::provider::tts::voicevox::{VoicevoxConfig, VoicevoxProvider};
use voxloop::provider::{SttProvider, TtsProvider};
use voxloop::server::{self, AppState};

#[derive(Debug, Parser)]
#[command(name = "voxloop", version, about = "Real-time voice conversation orchestrator")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "voxloop.toml", env = "VOXLOOP_CONFIG")]
    config: PathBuf,

    /// Override the listen address from the config.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let listen = cli.listen.unwrap_or_else(|| config.server.listen.clone());

    let assistant_name = config.conversation.assistant_name.clone();

    let history: Arc<dyn HistoryStore> = match config.history.mode.as_str() {
        "memory" => Arc::new(InMemoryHistory::new(&assistant_name)),
        "file" => Arc::new(FileHistory::open(&config.history.data_dir, &assistant_name).await?),
        other => bail!("unknown history.mode {other:?} (expected \"memory\" or \"file\")"),
    };

    let agent: Arc<dyn AgentEngine> = match config.agent.provider.as_str() {
        "echo" => Arc::new(EchoEngine),
        "openai" => {
            let mut openai = OpenAiConfig::new(&config.agent.openai.base_url, &config.agent.openai.model);
            if let Some(env_var) = &config.agent.openai.api_key_env {
                openai.api_key = std::env::var(env_var).ok();
            }
            Arc::new(OpenAiEngine::new(openai))
        }
        other => bail!("unknown agent.provider {other:?} (expected \"echo\" or \"openai\")"),
    };

    let tts: Arc<dyn TtsProvider> = match config.tts.provider.as_str() {
        "mock" => Arc::new(MockTtsProvider::instant()),
        "voicevox" => Arc::new(VoicevoxProvider::new(VoicevoxConfig {
            base_url: config.tts.voicevox.base_url.clone(),
            speaker_id: config.tts.voicevox.speaker_id,
            speed: config.tts.voicevox.speed,
        })),
        other => bail!("unknown tts.provider {other:?} (expected \"mock\" or \"voicevox\")"),
    };

    let stt: Arc<dyn SttProvider> = match config.stt.provider.as_str() {
        "mock" => Arc::new(MockSttProvider::fixed("")),
        other => bail!("unknown stt.provider {other:?} (expected \"mock\")"),
    };

    let settings = TurnSettings {
        playback_wait: config.conversation.playback_wait_duration()?,
        system_prompt: config.conversation.system_prompt.clone(),
        proactive_prompt: config.conversation.proactive_prompt.clone(),
        thinking_placeholder: config.conversation.thinking_placeholder.clone(),
        tts_concurrency: config.conversation.tts_concurrency,
    };

    info!(
        agent = agent.name(),
        tts = tts.name(),
        history = %config.history.mode,
        "voxloop starting"
    );

    let deps = TurnDeps {
        gate: Arc::new(ResponseGate::new()),
        agent,
        tts,
        stt,
        history,
        settings: Arc::new(settings),
    };

    let state = Arc::new(AppState {
        handler: Arc::new(ConversationHandler::new(deps)),
        default_assistant_name: assistant_name,
    });

    server::serve(&listen, state).await
}
