//! One human-to-assistant turn.
//!
//! Drives the full phase sequence: start signals, input normalization,
//! history append, agent streaming, ordered TTS, finalize, history
//! append, cleanup. Cancellation can land at any suspension point; the
//! partial response is persisted with a marker and cleanup always runs.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::tts::OrderedTtsManager;
use super::turn::{self, ERROR_MARKER, INTERRUPTED_MARKER};
use super::{ClientHandle, Recipients, TurnDeps, TurnError, TurnMetadata, TurnTrigger};
use crate::agent::AgentRequest;
use crate::protocol::ServerMessage;

/// How a turn ended, as seen by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    /// Empty input and not proactive; nothing was produced.
    EmptyInput,
    Failed,
    Interrupted,
}

/// A single conversation turn, run as one cooperatively scheduled task.
pub struct SingleTurn {
    pub deps: TurnDeps,
    pub client: ClientHandle,
    pub trigger: TurnTrigger,
    pub metadata: TurnMetadata,
    pub cancel: CancellationToken,
}

impl SingleTurn {
    pub async fn run(self) -> TurnOutcome {
        let recipients = Recipients::single(self.client.clone());
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
            result = drive(
                &self.deps,
                &self.client,
                &self.trigger,
                self.metadata,
                &recipients,
                &mut manager,
                &mut partial,
            ) => Some(result),
        };

        let client = &self.client.id;
        let outcome = match driven {
            Some(Ok(Some(response))) => {
                if !self.metadata.skip_history {
                    if let Err(e) = self.deps.history.append_assistant(client, &response, &[]).await
                    {
                        error!(client = %client, error = %e, "history append failed");
                    }
                }
                info!(
                    client = %client,
                    preview = crate::utils::safe_truncate(&response, 64),
                    "turn completed"
                );
                TurnOutcome::Completed
            }
            Some(Ok(None)) => {
                debug!(client = %client, "empty input, turn aborted");
                TurnOutcome::EmptyInput
            }
            Some(Err(e)) => {
                error!(client = %client, error = %e, "turn failed");
                recipients.send(&ServerMessage::Error {
                    message: e.to_string(),
                });
                if !self.metadata.skip_history {
                    if let Err(e) = self
                        .deps
                        .history
                        .append_assistant(client, &partial, &[ERROR_MARKER])
                        .await
                    {
                        error!(client = %client, error = %e, "history append failed");
                    }
                }
                recipients.send(&ServerMessage::chain_end());
                TurnOutcome::Failed
            }
            None => {
                info!(client = %client, "turn interrupted");
                if let Err(e) = self.deps.agent.handle_interrupt(client, &partial).await {
                    error!(client = %client, error = %e, "engine interrupt handling failed");
                }
                if !self.metadata.skip_history {
                    if let Err(e) = self
                        .deps
                        .history
                        .append_assistant(client, &partial, &[INTERRUPTED_MARKER])
                        .await
                    {
                        error!(client = %client, error = %e, "history append failed");
                    }
                }
                TurnOutcome::Interrupted
            }
        };

        turn::cleanup(&mut manager).await;
        outcome
    }
}

/// Phases 1-7. `Ok(None)` means the input was empty and the turn was
/// aborted (chain-end already sent). `Ok(Some(text))` carries the full
/// response.
async fn drive(
    deps: &TurnDeps,
    client: &ClientHandle,
    trigger: &TurnTrigger,
    metadata: TurnMetadata,
    recipients: &Recipients,
    manager: &mut OrderedTtsManager,
    partial: &mut String,
) -> Result<Option<String>, TurnError> {
    turn::send_start_signals(recipients, &deps.settings.thinking_placeholder);

    let input = turn::normalize_input(deps, trigger, recipients).await?;
    if input.trim().is_empty() && !metadata.proactive {
        recipients.send(&ServerMessage::chain_end());
        return Ok(None);
    }

    let context = if metadata.skip_memory {
        Vec::new()
    } else {
        deps.history
            .retrieve(&client.id, &input)
            .await
            .unwrap_or_else(|e| {
                debug!(client = %client.id, error = %e, "retrieval failed, continuing without context");
                Vec::new()
            })
    };

    if !metadata.skip_history {
        deps.history
            .append_user(&client.id, &input)
            .await
            .map_err(TurnError::History)?;
    }

    let request = AgentRequest {
        client: client.id.clone(),
        persona: client.name.clone(),
        system_prompt: deps.settings.system_prompt.clone(),
        user_text: input,
        context,
        metadata,
    };

    let mut stream = deps.agent.chat(request).await.map_err(TurnError::Agent)?;
    while let Some(item) = stream.next().await {
        let output = item.map_err(TurnError::Agent)?;
        turn::route_output(output, manager, partial, recipients);
    }

    turn::finalize(deps, manager, recipients).await;
    Ok(Some(partial.clone()))
}
