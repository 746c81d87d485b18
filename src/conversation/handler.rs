//! Entry point for every inbound client event.
//!
//! Classifies messages (gate responses, triggers, interrupts), enforces
//! one turn per client or group through an atomic check-and-create task
//! slot, and owns cancellation: an interrupt cancels the turn task, waits
//! for it to settle, then broadcasts `interrupt-signal`.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::group::{GroupFlow, GroupRegistry};
use super::single::{SingleTurn, TurnOutcome};
use super::{
    ClientHandle, ClientId, ClientRegistry, GroupId, Recipients, TurnDeps, TurnMetadata,
    TurnTrigger,
};
use crate::protocol::{ClientMessage, ServerMessage};

/// Key of one turn slot: a lone client or a whole group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SlotKey {
    Client(ClientId),
    Group(GroupId),
}

/// A running turn task.
struct ActiveTurn {
    id: Uuid,
    cancel: CancellationToken,
    handle: Option<JoinHandle<TurnOutcome>>,
}

impl ActiveTurn {
    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// Routes inbound events and owns the turn-per-slot invariant.
pub struct ConversationHandler {
    pub clients: Arc<ClientRegistry>,
    pub groups: Arc<GroupRegistry>,
    pub deps: TurnDeps,
    slots: DashMap<SlotKey, ActiveTurn>,
}

impl ConversationHandler {
    pub fn new(deps: TurnDeps) -> Self {
        Self {
            clients: Arc::new(ClientRegistry::new()),
            groups: Arc::new(GroupRegistry::new()),
            deps,
            slots: DashMap::new(),
        }
    }

    /// Handle one inbound message from `client`.
    pub async fn on_message(self: &Arc<Self>, client: &ClientId, message: ClientMessage) {
        // Responses the gate knows about never start turns.
        if self.deps.gate.deliver(client, &message) {
            return;
        }

        match message {
            ClientMessage::TextInput { text } => {
                self.dispatch(client, TurnTrigger::Text(text), TurnMetadata::default());
            }
            ClientMessage::MicAudioEnd { text, audio } => {
                let audio = match audio {
                    Some(encoded) => match BASE64.decode(encoded.as_bytes()) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(client = %client, error = %e, "undecodable audio payload");
                            Vec::new()
                        }
                    },
                    None => Vec::new(),
                };
                self.dispatch(
                    client,
                    TurnTrigger::CapturedAudio { audio, text },
                    TurnMetadata::default(),
                );
            }
            ClientMessage::AiSpeakSignal => {
                self.dispatch(client, TurnTrigger::Proactive, TurnMetadata::proactive());
            }
            ClientMessage::Interrupt => {
                self.interrupt(client).await;
            }
            ClientMessage::FrontendPlaybackComplete { .. } => {
                // Already consumed by the gate above.
            }
        }
    }

    /// Whether a turn is currently running for this client's slot.
    pub fn is_busy(&self, client: &ClientId) -> bool {
        self.slots
            .get(&self.slot_key_for(client))
            .map(|t| t.is_running())
            .unwrap_or(false)
    }

    /// Spawn the flow for a trigger unless its slot already runs a turn.
    /// The check-and-create is atomic per slot key.
    fn dispatch(self: &Arc<Self>, client: &ClientId, trigger: TurnTrigger, metadata: TurnMetadata) {
        let Some(handle) = self.clients.get(client) else {
            warn!(client = %client, "trigger from unregistered client dropped");
            return;
        };

        let key = self.slot_key_for(client);
        match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_running() {
                    debug!(?key, "turn in progress, trigger rejected");
                    return;
                }
                let turn = self.spawn_turn(key, handle, trigger, metadata);
                occupied.insert(turn);
            }
            Entry::Vacant(vacant) => {
                let turn = self.spawn_turn(key, handle, trigger, metadata);
                vacant.insert(turn);
            }
        }
    }

    fn slot_key_for(&self, client: &ClientId) -> SlotKey {
        match self.groups.group_of(client) {
            Some(group) if self.groups.member_count(&group) >= 2 => SlotKey::Group(group),
            _ => SlotKey::Client(client.clone()),
        }
    }

    fn spawn_turn(
        self: &Arc<Self>,
        key: SlotKey,
        client: ClientHandle,
        trigger: TurnTrigger,
        metadata: TurnMetadata,
    ) -> ActiveTurn {
        let cancel = CancellationToken::new();
        let turn_id = Uuid::new_v4();
        let handler = Arc::clone(self);
        let task_cancel = cancel.clone();
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            let outcome = match &task_key {
                SlotKey::Client(_) => {
                    SingleTurn {
                        deps: handler.deps.clone(),
                        client,
                        trigger,
                        metadata,
                        cancel: task_cancel,
                    }
                    .run()
                    .await
                }
                SlotKey::Group(group) => {
                    GroupFlow {
                        deps: handler.deps.clone(),
                        clients: Arc::clone(&handler.clients),
                        groups: Arc::clone(&handler.groups),
                        group: group.clone(),
                        trigger_client: client,
                        trigger,
                        metadata,
                        cancel: task_cancel,
                    }
                    .run()
                    .await
                }
            };

            // Free the slot unless a newer turn already replaced it.
            handler
                .slots
                .remove_if(&task_key, |_, turn| turn.id == turn_id);
            outcome
        });

        info!(?key, turn = %turn_id, "turn spawned");
        ActiveTurn {
            id: turn_id,
            cancel,
            handle: Some(handle),
        }
    }

    /// Cancel the active turn for this client's slot, wait for the
    /// cancellation to settle, and broadcast `interrupt-signal` to every
    /// affected client. No-op when nothing is running.
    pub async fn interrupt(self: &Arc<Self>, client: &ClientId) {
        let key = self.slot_key_for(client);
        let Some((_, mut turn)) = self.slots.remove(&key) else {
            debug!(client = %client, "interrupt with no active turn");
            return;
        };

        turn.cancel.cancel();
        if let Some(handle) = turn.handle.take() {
            // The flow's cancel path persists partials and runs cleanup.
            let _ = handle.await;
        }

        self.affected_recipients(&key)
            .send(&ServerMessage::InterruptSignal);

        if let SlotKey::Group(group) = &key {
            self.groups.release_conversation(group);
        }
        info!(?key, "turn interrupted");
    }

    fn affected_recipients(&self, key: &SlotKey) -> Recipients {
        match key {
            SlotKey::Client(id) => Recipients::broadcast(
                self.clients.get(id).into_iter().collect(),
            ),
            SlotKey::Group(group) => Recipients::broadcast(
                self.groups
                    .members(group)
                    .into_iter()
                    .filter_map(|id| self.clients.get(&id))
                    .collect(),
            ),
        }
    }

    /// Tear down everything a disconnecting client holds: gate waiters
    /// are released first so no flow stays parked on a dead socket.
    pub async fn client_disconnected(self: &Arc<Self>, client: &ClientId) {
        self.deps.gate.release_client(client);

        if let Some(report) = self.groups.leave(client) {
            if report.was_current_speaker {
                // Leaving mid-turn cancels the group chain as an interrupt.
                if let Some((_, mut turn)) = self.slots.remove(&SlotKey::Group(report.group.clone()))
                {
                    turn.cancel.cancel();
                    if let Some(handle) = turn.handle.take() {
                        let _ = handle.await;
                    }
                    self.affected_recipients(&SlotKey::Group(report.group.clone()))
                        .send(&ServerMessage::InterruptSignal);
                }
                self.groups.release_conversation(&report.group);
            } else if report.group_empty {
                self.groups.release_conversation(&report.group);
            }
        }

        if let Some((_, mut turn)) = self.slots.remove(&SlotKey::Client(client.clone())) {
            turn.cancel.cancel();
            if let Some(handle) = turn.handle.take() {
                let _ = handle.await;
            }
        }

        self.clients.unregister(client);
        info!(client = %client, "client torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::{ScriptedEngine, ScriptedResponse};
    use crate::conversation::gate::ResponseGate;
    use crate::conversation::TurnSettings;
    use crate::memory::{HistoryStore, InMemoryHistory};
    use crate::provider::stt::mock::MockSttProvider;
    use crate::provider::tts::mock::MockTtsProvider;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn handler_with(script: Vec<ScriptedResponse>) -> Arc<ConversationHandler> {
        let deps = TurnDeps {
            gate: Arc::new(ResponseGate::new()),
            agent: Arc::new(ScriptedEngine::new(script)),
            tts: Arc::new(MockTtsProvider::instant()),
            stt: Arc::new(MockSttProvider::fixed("")),
            history: Arc::new(InMemoryHistory::new("Bot")),
            settings: Arc::new(TurnSettings {
                playback_wait: Duration::from_millis(20),
                ..Default::default()
            }),
        };
        Arc::new(ConversationHandler::new(deps))
    }

    fn connect(
        handler: &Arc<ConversationHandler>,
        id: &str,
        name: &str,
    ) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        handler
            .clients
            .register(ClientHandle::new(ClientId::from(id), name.into(), tx));
        rx
    }

    #[tokio::test]
    async fn slot_key_is_group_only_with_two_members() {
        let handler = handler_with(vec![]);
        let _rx = connect(&handler, "a", "A");
        let group = GroupId::from_room("lounge");
        handler.groups.join(&group, &ClientId::from("a"));

        assert_eq!(
            handler.slot_key_for(&ClientId::from("a")),
            SlotKey::Client(ClientId::from("a")),
            "a one-member room is a single conversation"
        );

        let _rx_b = connect(&handler, "b", "B");
        handler.groups.join(&group, &ClientId::from("b"));
        assert_eq!(
            handler.slot_key_for(&ClientId::from("a")),
            SlotKey::Group(group)
        );
    }

    #[tokio::test]
    async fn concurrent_trigger_is_rejected() {
        let handler = handler_with(vec![
            ScriptedResponse::sentences(&["Busy."]).with_delay(Duration::from_millis(100)),
            ScriptedResponse::sentences(&["Second."]),
        ]);
        let mut rx = connect(&handler, "c1", "Bot");
        let client = ClientId::from("c1");

        handler
            .on_message(&client, ClientMessage::TextInput { text: "one".into() })
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handler.is_busy(&client));

        // Second trigger lands while the first turn runs.
        handler
            .on_message(&client, ClientMessage::TextInput { text: "two".into() })
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Only one chain-start was emitted.
        let mut starts = 0;
        while let Ok(msg) = rx.try_recv() {
            if matches!(
                msg,
                ServerMessage::Control {
                    action: crate::protocol::ControlAction::ConversationChainStart
                }
            ) {
                starts += 1;
            }
        }
        assert_eq!(starts, 1);

        handler.interrupt(&client).await;
    }

    #[tokio::test]
    async fn interrupt_with_no_turn_is_noop() {
        let handler = handler_with(vec![]);
        let mut rx = connect(&handler, "c1", "Bot");
        handler.interrupt(&ClientId::from("c1")).await;
        assert!(rx.try_recv().is_err(), "no interrupt-signal without a turn");
    }

    #[tokio::test]
    async fn interrupt_cancels_and_broadcasts_signal() {
        let handler = handler_with(vec![ScriptedResponse::sentences(&[
            "One.", "Two.", "Three.",
        ])
        .with_delay(Duration::from_millis(40))]);
        let mut rx = connect(&handler, "c1", "Bot");
        let client = ClientId::from("c1");

        handler
            .on_message(&client, ClientMessage::TextInput { text: "hi".into() })
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        handler.on_message(&client, ClientMessage::Interrupt).await;

        assert!(!handler.is_busy(&client));
        let mut saw_signal = false;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, ServerMessage::InterruptSignal) {
                saw_signal = true;
            }
        }
        assert!(saw_signal);

        // Partial response was persisted with the marker.
        let lines = handler
            .deps
            .history
            .lines(&client)
            .await
            .unwrap();
        assert_eq!(lines.last().unwrap(), "[Interrupted by user]");
    }

    #[tokio::test]
    async fn new_turn_allowed_after_completion() {
        let handler = handler_with(vec![
            ScriptedResponse::sentences(&["First."]),
            ScriptedResponse::sentences(&["Second."]),
        ]);
        let mut rx = connect(&handler, "c1", "Bot");
        let client = ClientId::from("c1");

        handler
            .on_message(&client, ClientMessage::TextInput { text: "one".into() })
            .await;
        // Playback wait (20 ms) times out, the turn completes.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handler.is_busy(&client));

        handler
            .on_message(&client, ClientMessage::TextInput { text: "two".into() })
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let mut starts = 0;
        while let Ok(msg) = rx.try_recv() {
            if matches!(
                msg,
                ServerMessage::Control {
                    action: crate::protocol::ControlAction::ConversationChainStart
                }
            ) {
                starts += 1;
            }
        }
        assert_eq!(starts, 2);
    }

    #[tokio::test]
    async fn disconnect_releases_gate_and_cancels_turn() {
        let handler = handler_with(vec![ScriptedResponse::sentences(&["Slow."])
            .with_delay(Duration::from_millis(200))]);
        let _rx = connect(&handler, "c1", "Bot");
        let client = ClientId::from("c1");

        handler
            .on_message(&client, ClientMessage::TextInput { text: "hi".into() })
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handler.is_busy(&client));

        handler.client_disconnected(&client).await;
        assert!(!handler.is_busy(&client));
        assert!(handler.clients.get(&client).is_none());
        assert_eq!(handler.deps.gate.pending(), 0);
    }

    #[tokio::test]
    async fn proactive_trigger_runs_without_history() {
        let handler = handler_with(vec![ScriptedResponse::sentences(&["Ping!"])]);
        let mut rx = connect(&handler, "c1", "Bot");
        let client = ClientId::from("c1");

        handler.on_message(&client, ClientMessage::AiSpeakSignal).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let mut saw_audio = false;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, ServerMessage::AudioResponse { .. }) {
                saw_audio = true;
            }
        }
        assert!(saw_audio);
        assert!(handler.deps.history.lines(&client).await.unwrap().is_empty());
    }
}
