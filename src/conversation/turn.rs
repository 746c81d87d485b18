//! Helpers shared by the single and group conversation flows.
//!
//! Each is a small, deterministic step: start signals, input
//! normalization, output routing, finalize, cleanup. Flows compose them
//! so every exit path behaves identically.

use tracing::{debug, warn};

use super::gate::{ResponseKind, WaitOutcome};
use super::tts::OrderedTtsManager;
use super::{Recipients, TurnDeps, TurnError, TurnTrigger};
use crate::agent::AgentOutput;
use crate::protocol::ServerMessage;

/// History marker appended after a user-cancelled response.
pub const INTERRUPTED_MARKER: &str = "[Interrupted by user]";

/// History marker appended after an agent failure.
pub const ERROR_MARKER: &str = "[error]";

/// Emit `conversation-chain-start` plus the thinking placeholder so the
/// UI shows activity before any model work begins.
pub fn send_start_signals(recipients: &Recipients, placeholder: &str) {
    recipients.send(&ServerMessage::chain_start());
    recipients.send(&ServerMessage::FullText {
        text: placeholder.to_string(),
    });
}

/// Resolve the trigger to user text, running STT for captured audio.
/// Empty strings are valid and propagate.
pub async fn normalize_input(
    deps: &TurnDeps,
    trigger: &TurnTrigger,
    recipients: &Recipients,
) -> Result<String, TurnError> {
    match trigger {
        TurnTrigger::Text(text) => Ok(text.clone()),
        TurnTrigger::CapturedAudio { audio, text } => {
            let transcript = match text {
                Some(t) => t.clone(),
                None => deps
                    .stt
                    .transcribe(audio)
                    .await
                    .map_err(TurnError::Input)?,
            };
            recipients.send(&ServerMessage::UserInputTranscription {
                text: transcript.clone(),
            });
            Ok(transcript)
        }
        TurnTrigger::Proactive => Ok(deps.settings.proactive_prompt.clone()),
    }
}

/// Route one agent output: sentences and pre-rendered audio go through
/// the sequence-assigning TTS path, tool status goes straight to the
/// client. Display text accumulates into `partial` so an interruption
/// can persist what was already produced.
pub fn route_output(
    output: AgentOutput,
    manager: &mut OrderedTtsManager,
    partial: &mut String,
    recipients: &Recipients,
) {
    match output {
        AgentOutput::Sentence(sentence) => {
            push_partial(partial, &sentence.display_text);
            manager.speak(sentence);
        }
        AgentOutput::Audio(audio) => {
            push_partial(partial, &audio.display_text);
            manager.speak_prerendered(audio);
        }
        AgentOutput::ToolStatus(status) => {
            recipients.send(&ServerMessage::ToolCallStatus {
                name: status.name,
                status: status.status,
                detail: status.detail,
            });
        }
    }
}

fn push_partial(partial: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if !partial.is_empty() {
        partial.push(' ');
    }
    partial.push_str(text);
}

/// Close out a turn's audio: drain the TTS manager, announce synthesis
/// completion, and wait (bounded) for every recipient to confirm
/// playback. Ends with `conversation-chain-end` on every path.
///
/// Returns `true` when all recipients confirmed in time. A timeout is
/// logged and tolerated: keeping history consistent matters more than an
/// extra wait on a stuck client.
pub async fn finalize(
    deps: &TurnDeps,
    manager: &mut OrderedTtsManager,
    recipients: &Recipients,
) -> bool {
    manager.drain().await;

    // Register before announcing completion so a fast client's
    // confirmation cannot race the wait.
    let clients = recipients.client_ids();
    let pending: Vec<_> = clients
        .iter()
        .map(|client| {
            deps.gate
                .register(client, ResponseKind::PlaybackComplete, None)
        })
        .collect();
    recipients.send(&ServerMessage::BackendSynthComplete);

    let timeout = deps.settings.playback_wait;
    let waits = clients.into_iter().zip(pending).map(|(client, wait)| async move {
        match wait.wait(Some(timeout)).await {
            WaitOutcome::Delivered(_) => true,
            WaitOutcome::TimedOut => {
                warn!(client = %client, "playback confirmation timed out");
                false
            }
            WaitOutcome::Cancelled => {
                debug!(client = %client, "playback wait cancelled");
                false
            }
        }
    });
    let confirmations = futures::future::join_all(waits).await;
    let confirmed = confirmations.iter().all(|ok| *ok);

    if confirmed {
        recipients.send(&ServerMessage::ForceNewMessage);
    }
    recipients.send(&ServerMessage::chain_end());
    confirmed
}

/// Release everything a turn holds. Safe to call on every exit path,
/// any number of times.
pub async fn cleanup(manager: &mut OrderedTtsManager) {
    manager.clear().await;
}
