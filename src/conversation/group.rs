//! Group conversations: round-robin over N assistants sharing one history.
//!
//! Membership (who is in which room) outlives conversations; the
//! per-group conversation state is init-on-create when a trigger starts a
//! chain and remove-on-cleanup when the chain is interrupted or the room
//! empties. Every payload produced during a member's turn is broadcast to
//! all members, and each member only ever receives the history slice it
//! has not yet observed.

use std::collections::{HashMap, VecDeque};

use dashmap::DashMap;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::single::TurnOutcome;
use super::tts::OrderedTtsManager;
use super::turn::{self, ERROR_MARKER, INTERRUPTED_MARKER};
use super::{
    ClientHandle, ClientId, ClientRegistry, GroupId, Recipients, TurnDeps, TurnMetadata,
    TurnTrigger,
};
use crate::agent::AgentRequest;
use crate::protocol::ServerMessage;
use std::sync::Arc;

// ── Group state ──────────────────────────────────────────────────

/// Conversation state of one active group chain.
#[derive(Debug)]
pub struct GroupState {
    /// Ordered utterances, `"<speaker>: <text>"` plus marker lines.
    pub history: Vec<String>,
    /// Count of history entries each member has already observed.
    pub read_index: HashMap<ClientId, usize>,
    /// Speaking order; head speaks next, then is re-appended at the tail.
    pub queue: VecDeque<ClientId>,
    /// Non-empty only while a member is mid-turn.
    pub current_speaker: Option<ClientId>,
    /// Short identifier used in logs.
    pub session_tag: String,
}

/// What `leave` observed, so the caller can interrupt if needed.
#[derive(Debug, Clone)]
pub struct LeaveReport {
    pub group: GroupId,
    pub was_current_speaker: bool,
    pub group_empty: bool,
}

/// Process-wide group membership and conversation registry.
#[derive(Default)]
pub struct GroupRegistry {
    /// Room members in join order.
    membership: DashMap<GroupId, Vec<ClientId>>,
    member_of: DashMap<ClientId, GroupId>,
    /// Active conversation chains.
    conversations: DashMap<GroupId, GroupState>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `client` to `group`. A member joining mid-conversation is
    /// appended to the queue tail and starts reading at the current
    /// history length: it does not retroactively see past turns.
    pub fn join(&self, group: &GroupId, client: &ClientId) {
        let mut members = self.membership.entry(group.clone()).or_default();
        if !members.contains(client) {
            members.push(client.clone());
        }
        self.member_of.insert(client.clone(), group.clone());

        if let Some(mut state) = self.conversations.get_mut(group) {
            if !state.queue.contains(client) && state.current_speaker.as_ref() != Some(client) {
                state.queue.push_back(client.clone());
                let len = state.history.len();
                state.read_index.insert(client.clone(), len);
            }
        }
        debug!(group = %group, client = %client, "joined group");
    }

    /// Remove `client` from its group, if any.
    pub fn leave(&self, client: &ClientId) -> Option<LeaveReport> {
        let (_, group) = self.member_of.remove(client)?;

        let mut group_empty = false;
        if let Some(mut members) = self.membership.get_mut(&group) {
            members.retain(|m| m != client);
            group_empty = members.is_empty();
        }
        if group_empty {
            self.membership.remove(&group);
        }

        let mut was_current_speaker = false;
        if let Some(mut state) = self.conversations.get_mut(&group) {
            state.queue.retain(|m| m != client);
            state.read_index.remove(client);
            if state.current_speaker.as_ref() == Some(client) {
                state.current_speaker = None;
                was_current_speaker = true;
            }
        }

        debug!(group = %group, client = %client, "left group");
        Some(LeaveReport {
            group,
            was_current_speaker,
            group_empty,
        })
    }

    pub fn group_of(&self, client: &ClientId) -> Option<GroupId> {
        self.member_of.get(client).map(|g| g.value().clone())
    }

    pub fn members(&self, group: &GroupId) -> Vec<ClientId> {
        self.membership
            .get(group)
            .map(|m| m.value().clone())
            .unwrap_or_default()
    }

    pub fn member_count(&self, group: &GroupId) -> usize {
        self.membership.get(group).map(|m| m.len()).unwrap_or(0)
    }

    /// Initialize the conversation state for a chain: queue in join
    /// order, all read cursors at zero. No-op if a chain is active.
    pub fn start_conversation(&self, group: &GroupId) {
        self.conversations.entry(group.clone()).or_insert_with(|| {
            let members = self.members(group);
            let session_tag = crate::utils::short_id();
            info!(group = %group, session = %session_tag, members = members.len(), "group conversation started");
            GroupState {
                history: Vec::new(),
                read_index: members.iter().map(|m| (m.clone(), 0)).collect(),
                queue: members.into(),
                current_speaker: None,
                session_tag,
            }
        });
    }

    /// Drop the conversation state (chain ended or interrupted).
    /// Idempotent; membership is untouched.
    pub fn release_conversation(&self, group: &GroupId) {
        if let Some((_, state)) = self.conversations.remove(group) {
            info!(group = %group, session = %state.session_tag, "group conversation released");
        }
    }

    pub fn append_line(&self, group: &GroupId, line: String) {
        if let Some(mut state) = self.conversations.get_mut(group) {
            state.history.push(line);
        }
    }

    /// Pop the next speaker and return the history slice it has not yet
    /// observed. `None` when the queue is empty or no chain is active.
    pub fn begin_turn(&self, group: &GroupId) -> Option<(ClientId, Vec<String>)> {
        let mut state = self.conversations.get_mut(group)?;
        let member = state.queue.pop_front()?;
        state.current_speaker = Some(member.clone());
        let from = state.read_index.get(&member).copied().unwrap_or(0);
        let context = state.history[from.min(state.history.len())..].to_vec();
        Some((member, context))
    }

    /// Record the member's contribution, advance its read cursor to the
    /// new history end, and rotate it to the queue tail.
    pub fn finish_turn(&self, group: &GroupId, member: &ClientId, lines: Vec<String>) {
        let Some(mut state) = self.conversations.get_mut(group) else {
            return;
        };
        state.history.extend(lines);
        let len = state.history.len();
        state.read_index.insert(member.clone(), len);
        if !state.queue.contains(member) {
            state.queue.push_back(member.clone());
        }
        state.current_speaker = None;
    }

    /// Clear `current_speaker` without rotating (member vanished mid-turn).
    pub fn abandon_turn(&self, group: &GroupId, member: &ClientId) {
        if let Some(mut state) = self.conversations.get_mut(group) {
            if state.current_speaker.as_ref() == Some(member) {
                state.current_speaker = None;
            }
        }
    }

    /// Inspect a conversation (tests and diagnostics).
    pub fn with_conversation<R>(
        &self,
        group: &GroupId,
        f: impl FnOnce(&GroupState) -> R,
    ) -> Option<R> {
        self.conversations.get(group).map(|state| f(state.value()))
    }
}

// ── Group flow ───────────────────────────────────────────────────

/// A group conversation chain, run as one cooperatively scheduled task.
pub struct GroupFlow {
    pub deps: TurnDeps,
    pub clients: Arc<ClientRegistry>,
    pub groups: Arc<GroupRegistry>,
    pub group: GroupId,
    pub trigger_client: ClientHandle,
    pub trigger: TurnTrigger,
    pub metadata: TurnMetadata,
    pub cancel: CancellationToken,
}

impl GroupFlow {
    pub async fn run(self) -> TurnOutcome {
        self.groups.start_conversation(&self.group);

        let recipients = self.current_recipients();
        let input = match turn::normalize_input(&self.deps, &self.trigger, &recipients).await {
            Ok(text) => text,
            Err(e) => {
                error!(group = %self.group, error = %e, "group trigger normalization failed");
                recipients.send(&ServerMessage::Error {
                    message: e.to_string(),
                });
                self.groups.release_conversation(&self.group);
                return TurnOutcome::Failed;
            }
        };
        if input.trim().is_empty() && !self.metadata.proactive {
            self.groups.release_conversation(&self.group);
            return TurnOutcome::EmptyInput;
        }
        self.groups.append_line(
            &self.group,
            format!("{}: {}", self.trigger_client.name, input),
        );

        // Round-robin until the room empties or the chain is interrupted.
        loop {
            let Some((member, context)) = self.groups.begin_turn(&self.group) else {
                break;
            };

            let Some(member_handle) = self.clients.get(&member) else {
                warn!(group = %self.group, member = %member, "speaker vanished, skipping");
                self.groups.abandon_turn(&self.group, &member);
                self.groups.leave(&member);
                continue;
            };

            let recipients = self.current_recipients();
            if recipients.is_empty() {
                self.groups.abandon_turn(&self.group, &member);
                break;
            }

            let mut manager = OrderedTtsManager::new(
                self.deps.tts.clone(),
                recipients.clone(),
                self.deps.settings.tts_concurrency,
                &self.cancel,
            );
            let mut partial = String::new();

            let cancel = self.cancel.clone();
            let driven = tokio::select! {
                _ = cancel.cancelled() => None,
                result = speak_round(
                    &self.deps,
                    &member_handle,
                    &context,
                    self.metadata,
                    &recipients,
                    &mut manager,
                    &mut partial,
                ) => Some(result),
            };

            match driven {
                Some(Ok(response)) => {
                    self.groups.finish_turn(
                        &self.group,
                        &member,
                        vec![format!("{}: {}", member_handle.name, response)],
                    );
                    turn::cleanup(&mut manager).await;
                }
                Some(Err(e)) => {
                    // One member's engine failing aborts only its turn.
                    error!(group = %self.group, member = %member, error = %e, "member turn failed");
                    recipients.send(&ServerMessage::Error {
                        message: e.to_string(),
                    });
                    recipients.send(&ServerMessage::chain_end());
                    self.groups.finish_turn(
                        &self.group,
                        &member,
                        vec![
                            format!("{}: {}", member_handle.name, partial),
                            ERROR_MARKER.to_string(),
                        ],
                    );
                    turn::cleanup(&mut manager).await;
                }
                None => {
                    info!(group = %self.group, member = %member, "group chain interrupted");
                    if let Err(e) = self
                        .deps
                        .agent
                        .handle_interrupt(&member_handle.id, &partial)
                        .await
                    {
                        error!(member = %member, error = %e, "engine interrupt handling failed");
                    }
                    self.groups.finish_turn(
                        &self.group,
                        &member,
                        vec![
                            format!("{}: {}", member_handle.name, partial),
                            INTERRUPTED_MARKER.to_string(),
                        ],
                    );
                    turn::cleanup(&mut manager).await;
                    return TurnOutcome::Interrupted;
                }
            }
        }

        self.groups.release_conversation(&self.group);
        TurnOutcome::Completed
    }

    fn current_recipients(&self) -> Recipients {
        let handles = self
            .groups
            .members(&self.group)
            .into_iter()
            .filter_map(|id| self.clients.get(&id))
            .collect();
        Recipients::broadcast(handles)
    }
}

/// One member's speaking round: start signals, agent stream over the
/// unseen history slice, ordered TTS, finalize gated on every member's
/// playback confirmation.
async fn speak_round(
    deps: &TurnDeps,
    member: &ClientHandle,
    context: &[String],
    metadata: TurnMetadata,
    recipients: &Recipients,
    manager: &mut OrderedTtsManager,
    partial: &mut String,
) -> Result<String, anyhow::Error> {
    turn::send_start_signals(recipients, &deps.settings.thinking_placeholder);

    let request = AgentRequest {
        client: member.id.clone(),
        persona: member.name.clone(),
        system_prompt: deps.settings.system_prompt.clone(),
        user_text: context.join("\n"),
        context: Vec::new(),
        metadata,
    };

    let mut stream = deps.agent.chat(request).await?;
    while let Some(item) = stream.next().await {
        let output = item?;
        turn::route_output(output, manager, partial, recipients);
    }

    turn::finalize(deps, manager, recipients).await;
    Ok(partial.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::{ScriptedEngine, ScriptedResponse};
    use crate::conversation::gate::ResponseGate;
    use crate::conversation::TurnSettings;
    use crate::memory::InMemoryHistory;
    use crate::protocol::ServerMessage;
    use crate::provider::stt::mock::MockSttProvider;
    use crate::provider::tts::mock::MockTtsProvider;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn group() -> GroupId {
        GroupId::from_room("lounge")
    }

    #[test]
    fn join_order_drives_queue_order() {
        let registry = GroupRegistry::new();
        registry.join(&group(), &ClientId::from("a"));
        registry.join(&group(), &ClientId::from("b"));
        registry.start_conversation(&group());

        let queue: Vec<ClientId> = registry
            .with_conversation(&group(), |s| s.queue.iter().cloned().collect())
            .unwrap();
        assert_eq!(queue, vec![ClientId::from("a"), ClientId::from("b")]);
    }

    #[test]
    fn read_cursor_windows_history() {
        let registry = GroupRegistry::new();
        let (a, b) = (ClientId::from("a"), ClientId::from("b"));
        registry.join(&group(), &a);
        registry.join(&group(), &b);
        registry.start_conversation(&group());

        registry.append_line(&group(), "Alice: start".into());

        // a speaks first, sees the trigger line.
        let (member, context) = registry.begin_turn(&group()).unwrap();
        assert_eq!(member, a);
        assert_eq!(context, vec!["Alice: start".to_string()]);
        registry.finish_turn(&group(), &a, vec!["BotA: hello".into()]);

        // b sees both the trigger and a's response.
        let (member, context) = registry.begin_turn(&group()).unwrap();
        assert_eq!(member, b);
        assert_eq!(
            context,
            vec!["Alice: start".to_string(), "BotA: hello".to_string()]
        );
        registry.finish_turn(&group(), &b, vec!["BotB: hi".into()]);

        // a's second round sees only what was appended since its first.
        let (member, context) = registry.begin_turn(&group()).unwrap();
        assert_eq!(member, a);
        assert_eq!(context, vec!["BotB: hi".to_string()]);

        // Cursor equals history length after each finished turn.
        registry.finish_turn(&group(), &a, vec!["BotA: again".into()]);
        let (cursor, len) = registry
            .with_conversation(&group(), |s| (s.read_index[&a], s.history.len()))
            .unwrap();
        assert_eq!(cursor, len);
    }

    #[test]
    fn mid_conversation_join_starts_at_current_history() {
        let registry = GroupRegistry::new();
        let a = ClientId::from("a");
        registry.join(&group(), &a);
        registry.start_conversation(&group());
        registry.append_line(&group(), "line one".into());
        registry.append_line(&group(), "line two".into());

        let late = ClientId::from("late");
        registry.join(&group(), &late);

        let (cursor, queue_len) = registry
            .with_conversation(&group(), |s| (s.read_index[&late], s.queue.len()))
            .unwrap();
        assert_eq!(cursor, 2, "no retroactive visibility");
        assert_eq!(queue_len, 2);
    }

    #[test]
    fn leave_clears_member_and_reports_speaker() {
        let registry = GroupRegistry::new();
        let (a, b) = (ClientId::from("a"), ClientId::from("b"));
        registry.join(&group(), &a);
        registry.join(&group(), &b);
        registry.start_conversation(&group());

        let (member, _) = registry.begin_turn(&group()).unwrap();
        assert_eq!(member, a);

        let report = registry.leave(&a).unwrap();
        assert!(report.was_current_speaker);
        assert!(!report.group_empty);
        assert!(registry.group_of(&a).is_none());

        let report = registry.leave(&b).unwrap();
        assert!(report.group_empty);
    }

    #[test]
    fn release_conversation_is_idempotent_and_keeps_membership() {
        let registry = GroupRegistry::new();
        let a = ClientId::from("a");
        registry.join(&group(), &a);
        registry.start_conversation(&group());

        registry.release_conversation(&group());
        registry.release_conversation(&group());

        assert_eq!(registry.member_count(&group()), 1);
        assert!(registry.with_conversation(&group(), |_| ()).is_none());
    }

    // ── Flow tests ───────────────────────────────────────────────

    struct GroupFixture {
        deps: TurnDeps,
        clients: Arc<ClientRegistry>,
        groups: Arc<GroupRegistry>,
        handles: Vec<ClientHandle>,
        rxs: Vec<mpsc::UnboundedReceiver<ServerMessage>>,
    }

    fn group_fixture(script: Vec<ScriptedResponse>, names: &[&str]) -> GroupFixture {
        let clients = Arc::new(ClientRegistry::new());
        let groups = Arc::new(GroupRegistry::new());
        let mut handles = Vec::new();
        let mut rxs = Vec::new();
        for name in names {
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = ClientHandle::new(
                ClientId::from(name.to_lowercase().as_str()),
                name.to_string(),
                tx,
            );
            clients.register(handle.clone());
            groups.join(&group(), &handle.id);
            handles.push(handle);
            rxs.push(rx);
        }
        let deps = TurnDeps {
            gate: Arc::new(ResponseGate::new()),
            agent: Arc::new(ScriptedEngine::new(script)),
            tts: Arc::new(MockTtsProvider::instant()),
            stt: Arc::new(MockSttProvider::fixed("")),
            history: Arc::new(InMemoryHistory::new("Bot")),
            settings: Arc::new(TurnSettings {
                playback_wait: Duration::from_millis(10),
                ..Default::default()
            }),
        };
        GroupFixture {
            deps,
            clients,
            groups,
            handles,
            rxs,
        }
    }

    #[tokio::test]
    async fn round_robin_broadcasts_and_rotates() {
        let fx = group_fixture(
            vec![
                ScriptedResponse::sentences(&["First response."]),
                ScriptedResponse::sentences(&["Second response."]),
            ],
            &["BotA", "BotB"],
        );

        let cancel = CancellationToken::new();
        let flow = GroupFlow {
            deps: fx.deps.clone(),
            clients: fx.clients.clone(),
            groups: fx.groups.clone(),
            group: group(),
            trigger_client: fx.handles[0].clone(),
            trigger: TurnTrigger::Text("start".into()),
            metadata: TurnMetadata::default(),
            cancel: cancel.clone(),
        };

        let task = tokio::spawn(flow.run());
        // Let two rounds complete (playback waits time out at 10 ms each).
        tokio::time::sleep(Duration::from_millis(120)).await;

        let history: Vec<String> = fx
            .groups
            .with_conversation(&group(), |s| s.history.clone())
            .unwrap();
        assert!(history.len() >= 3, "history was {history:?}");
        assert_eq!(history[0], "BotA: start");
        assert_eq!(history[1], "BotA: First response.");
        assert_eq!(history[2], "BotB: Second response.");

        cancel.cancel();
        let outcome = task.await.unwrap();
        assert_eq!(outcome, TurnOutcome::Interrupted);

        // Both members observed audio for the first round.
        for mut rx in fx.rxs {
            let mut saw_audio = false;
            while let Ok(msg) = rx.try_recv() {
                if matches!(msg, ServerMessage::AudioResponse { .. }) {
                    saw_audio = true;
                }
            }
            assert!(saw_audio, "every member hears every turn");
        }
    }

    #[tokio::test]
    async fn member_error_advances_round_robin() {
        let fx = group_fixture(
            vec![
                ScriptedResponse::sentences(&["Doomed."]).failing("engine exploded"),
                ScriptedResponse::sentences(&["Recovered."]),
            ],
            &["BotA", "BotB"],
        );

        let cancel = CancellationToken::new();
        let flow = GroupFlow {
            deps: fx.deps.clone(),
            clients: fx.clients.clone(),
            groups: fx.groups.clone(),
            group: group(),
            trigger_client: fx.handles[0].clone(),
            trigger: TurnTrigger::Text("go".into()),
            metadata: TurnMetadata::default(),
            cancel: cancel.clone(),
        };

        let task = tokio::spawn(flow.run());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let history: Vec<String> = fx
            .groups
            .with_conversation(&group(), |s| s.history.clone())
            .unwrap();
        assert!(history.contains(&ERROR_MARKER.to_string()));
        assert!(history.iter().any(|l| l == "BotB: Recovered."));

        cancel.cancel();
        let _ = task.await.unwrap();
    }

    #[tokio::test]
    async fn interrupt_persists_partial_with_marker() {
        let fx = group_fixture(
            vec![ScriptedResponse::sentences(&["Long one.", "Two.", "Three."])
                .with_delay(Duration::from_millis(40))],
            &["BotA", "BotB"],
        );

        let cancel = CancellationToken::new();
        let flow = GroupFlow {
            deps: fx.deps.clone(),
            clients: fx.clients.clone(),
            groups: fx.groups.clone(),
            group: group(),
            trigger_client: fx.handles[0].clone(),
            trigger: TurnTrigger::Text("go".into()),
            metadata: TurnMetadata::default(),
            cancel: cancel.clone(),
        };

        let task = tokio::spawn(flow.run());
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        let outcome = task.await.unwrap();
        assert_eq!(outcome, TurnOutcome::Interrupted);

        let history: Vec<String> = fx
            .groups
            .with_conversation(&group(), |s| s.history.clone())
            .unwrap();
        assert_eq!(history.last().unwrap(), INTERRUPTED_MARKER);
        assert!(history.iter().any(|l| l.starts_with("BotA: Long one.")));
    }
}
