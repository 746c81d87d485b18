//! Agent engine seam.
//!
//! The orchestrator consumes a lazy stream of [`AgentOutput`]s from an
//! engine; what produces them (local model, remote API, script) is behind
//! the [`AgentEngine`] trait.

pub mod mock;
pub mod openai;
pub mod splitter;
pub mod tags;

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;

use crate::conversation::{ClientId, TurnMetadata};
use crate::memory::MemoryFragment;
use crate::protocol::Actions;

/// A sentence-sized unit of the agent's response, in stream order.
///
/// `display_text` is what the user sees; `tts_text` is what gets
/// synthesized (emotion tags stripped). The delivery sequence number is
/// assigned by the TTS manager on submission, never by the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceOutput {
    pub display_text: String,
    pub tts_text: String,
    pub actions: Option<Actions>,
}

impl SentenceOutput {
    /// Build a sentence from raw text, extracting inline `[tag]` actions.
    pub fn from_raw(text: &str) -> Self {
        let parsed = tags::extract(text);
        Self {
            display_text: parsed.display_text,
            tts_text: parsed.tts_text,
            actions: parsed.actions,
        }
    }
}

/// Audio the engine rendered itself; serialized through the same
/// sequence-assigning path as synthesized sentences.
#[derive(Debug, Clone)]
pub struct PrerenderedAudio {
    pub audio: Vec<u8>,
    pub display_text: String,
    pub actions: Option<Actions>,
}

/// Progress of a tool invocation, forwarded verbatim to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallStatus {
    pub name: String,
    pub status: String,
    pub detail: Option<String>,
}

/// One item of the engine's lazy output sequence.
#[derive(Debug, Clone)]
pub enum AgentOutput {
    Sentence(SentenceOutput),
    Audio(PrerenderedAudio),
    ToolStatus(ToolCallStatus),
}

/// Everything an engine needs to produce one response.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub client: ClientId,
    /// Display name the response is attributed to.
    pub persona: String,
    pub system_prompt: String,
    pub user_text: String,
    /// Retrieved memory fragments (empty when `skip_memory`).
    pub context: Vec<MemoryFragment>,
    pub metadata: TurnMetadata,
}

pub type AgentStream = Pin<Box<dyn Stream<Item = Result<AgentOutput>> + Send>>;

/// A streaming conversational engine.
#[async_trait]
pub trait AgentEngine: Send + Sync {
    /// Start one response. The returned stream must stop yielding promptly
    /// when the consuming task is cancelled.
    async fn chat(&self, request: AgentRequest) -> Result<AgentStream>;

    /// Record that the response for `client` was truncated at
    /// `partial_text` so the engine's own context stays consistent.
    async fn handle_interrupt(&self, client: &ClientId, partial_text: &str) -> Result<()>;

    /// Human-readable engine name.
    fn name(&self) -> &str;
}
