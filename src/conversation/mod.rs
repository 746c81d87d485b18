//! Conversation turn orchestration.
//!
//! Guarantees one speaking turn at a time per client (or group), strict
//! sentence-order audio delivery despite parallel synthesis, and
//! interrupt handling that preserves partial responses in history.

pub mod gate;
pub mod group;
pub mod handler;
pub mod single;
pub mod tts;
pub mod turn;


use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::ServerMessage;

/// Opaque identifier of a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque identifier of a group of clients conversing jointly.
///
/// Derived deterministically from the room label the members opted into,
/// so it stays stable while members join and leave.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn from_room(room: &str) -> Self {
        Self(room.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-turn flags. Lifetime: one turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnMetadata {
    /// The assistant initiated this turn.
    pub proactive: bool,
    /// Do not consult or write retrieval memory.
    pub skip_memory: bool,
    /// Do not append to persistent history.
    pub skip_history: bool,
}

impl TurnMetadata {
    /// Metadata for an `ai-speak-signal` turn: the orchestrator's own
    /// solicitation must not pollute the conversational record.
    pub fn proactive() -> Self {
        Self {
            proactive: true,
            skip_memory: true,
            skip_history: true,
        }
    }
}

/// What set the turn in motion.
#[derive(Debug, Clone)]
pub enum TurnTrigger {
    /// Typed text.
    Text(String),
    /// Captured speech; `text` is set when the client already ran STT.
    CapturedAudio {
        audio: Vec<u8>,
        text: Option<String>,
    },
    /// Assistant-initiated.
    Proactive,
}

/// Turn-level failure classification.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("agent engine failed: {0}")]
    Agent(#[source] anyhow::Error),

    #[error("input normalization failed: {0}")]
    Input(#[source] anyhow::Error),

    #[error("history store failed: {0}")]
    History(#[source] anyhow::Error),
}

// ── Client registry ──────────────────────────────────────────────

/// Outbound handle for one connected client.
///
/// Messages pushed here are flushed to the socket by the client's writer
/// task; a closed channel means the client is gone.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: ClientId,
    /// Display name used for history lines and group transcripts.
    pub name: String,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl ClientHandle {
    pub fn new(id: ClientId, name: String, outbound: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self { id, name, outbound }
    }

    /// Push a message to this client. Returns `false` if the client's
    /// outbound channel is closed.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.outbound.send(msg).is_ok()
    }
}

/// Process-wide map of connected clients.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, ClientHandle>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ClientHandle) {
        debug!(client = %handle.id, name = %handle.name, "client registered");
        self.clients.insert(handle.id.clone(), handle);
    }

    pub fn unregister(&self, id: &ClientId) {
        if self.clients.remove(id).is_some() {
            debug!(client = %id, "client unregistered");
        }
    }

    pub fn get(&self, id: &ClientId) -> Option<ClientHandle> {
        self.clients.get(id).map(|h| h.value().clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

// ── Recipients ───────────────────────────────────────────────────

/// The set of clients a turn's output is delivered to.
///
/// A single conversation targets one client; a group turn broadcasts to
/// every member. A failed send to one recipient never blocks the others.
#[derive(Debug, Clone)]
pub struct Recipients {
    targets: Vec<ClientHandle>,
}

impl Recipients {
    pub fn single(handle: ClientHandle) -> Self {
        Self {
            targets: vec![handle],
        }
    }

    pub fn broadcast(targets: Vec<ClientHandle>) -> Self {
        Self { targets }
    }

    pub fn send(&self, msg: &ServerMessage) {
        for target in &self.targets {
            if !target.send(msg.clone()) {
                debug!(client = %target.id, "outbound channel closed, message dropped");
            }
        }
    }

    /// Client ids of every recipient, in order.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.targets.iter().map(|t| t.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Settings shared by every turn a handler runs.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    /// Bound on the wait for `frontend-playback-complete`.
    pub playback_wait: Duration,
    /// Base system prompt handed to the agent engine.
    pub system_prompt: String,
    /// Synthetic user input for proactive turns.
    pub proactive_prompt: String,
    /// Placeholder text shown while the model works.
    pub thinking_placeholder: String,
    /// Maximum concurrent TTS syntheses per turn.
    pub tts_concurrency: usize,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            playback_wait: Duration::from_secs(60),
            system_prompt: String::new(),
            proactive_prompt: "Please say something.".to_string(),
            thinking_placeholder: "Thinking...".to_string(),
            tts_concurrency: 3,
        }
    }
}

/// Shared collaborator handles threaded through every flow.
#[derive(Clone)]
pub struct TurnDeps {
    pub gate: Arc<gate::ResponseGate>,
    pub agent: Arc<dyn crate::agent::AgentEngine>,
    pub tts: Arc<dyn crate::provider::TtsProvider>,
    pub stt: Arc<dyn crate::provider::SttProvider>,
    pub history: Arc<dyn crate::memory::HistoryStore>,
    pub settings: Arc<TurnSettings>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_is_deterministic() {
        assert_eq!(GroupId::from_room("lounge"), GroupId::from_room("lounge"));
        assert_ne!(GroupId::from_room("lounge"), GroupId::from_room("study"));
    }

    #[test]
    fn proactive_metadata_skips_record() {
        let meta = TurnMetadata::proactive();
        assert!(meta.proactive && meta.skip_memory && meta.skip_history);
    }

    #[test]
    fn registry_register_and_unregister() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = ClientId::from("c1");
        registry.register(ClientHandle::new(id.clone(), "Alice".into(), tx));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id).unwrap().name, "Alice");

        registry.unregister(&id);
        assert!(registry.is_empty());
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn recipients_broadcast_tolerates_closed_channel() {
        let (tx_ok, mut rx_ok) = mpsc::unbounded_channel();
        let (tx_closed, rx_closed) = mpsc::unbounded_channel();
        drop(rx_closed);

        let recipients = Recipients::broadcast(vec![
            ClientHandle::new(ClientId::from("a"), "A".into(), tx_ok),
            ClientHandle::new(ClientId::from("b"), "B".into(), tx_closed),
        ]);

        recipients.send(&ServerMessage::ForceNewMessage);
        assert!(matches!(
            rx_ok.try_recv().unwrap(),
            ServerMessage::ForceNewMessage
        ));
    }
}
