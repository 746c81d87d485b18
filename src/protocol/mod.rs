//! Wire protocol for the client WebSocket.
//!
//! JSON messages tagged by `type`, one logical channel per client.
//! Inbound messages are either turn triggers, responses the conversation
//! flow is waiting on, or an interrupt. Outbound messages carry lifecycle
//! signals, text updates, and sequence-numbered audio chunks.

use serde::{Deserialize, Serialize};

/// Avatar hints attached to a sentence (expressions, emotions).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Actions {
    pub expressions: Vec<String>,
}

impl Actions {
    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }
}

// ── Inbound (client → orchestrator) ──────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// User typed text.
    TextInput { text: String },

    /// User finished speaking. `text` is present when the client ran STT
    /// itself; otherwise `audio` carries the captured utterance (base64).
    MicAudioEnd {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        audio: Option<String>,
    },

    /// Trigger a proactive (assistant-initiated) turn.
    AiSpeakSignal,

    /// The client's audio queue has drained.
    FrontendPlaybackComplete {
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Cancel the current turn.
    Interrupt,
}

// ── Outbound (orchestrator → client) ─────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlAction {
    ConversationChainStart,
    ConversationChainEnd,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Lifecycle signal.
    Control { action: ControlAction },

    /// Placeholder / full-text update.
    FullText { text: String },

    /// Echo of recognized speech.
    UserInputTranscription { text: String },

    /// One ordered audio chunk. `audio` is base64; empty on a synthesis
    /// failure sentinel. `sequence` is strictly increasing per turn.
    AudioResponse {
        audio: String,
        display_text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        actions: Option<Actions>,
        sequence: u64,
    },

    /// No further audio will be produced for this turn.
    BackendSynthComplete,

    /// The client should open a fresh display bubble.
    ForceNewMessage,

    /// The turn was cancelled.
    InterruptSignal,

    /// The agent used a tool.
    #[serde(rename = "tool_call_status")]
    ToolCallStatus {
        name: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    /// Failure during the turn.
    Error { message: String },
}

impl ServerMessage {
    pub fn chain_start() -> Self {
        Self::Control {
            action: ControlAction::ConversationChainStart,
        }
    }

    pub fn chain_end() -> Self {
        Self::Control {
            action: ControlAction::ConversationChainEnd,
        }
    }
}
