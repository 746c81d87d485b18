//! Deterministic engines for tests and offline runs.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;

use super::{
    AgentEngine, AgentOutput, AgentRequest, AgentStream, SentenceOutput, ToolCallStatus,
};
use crate::conversation::ClientId;

/// One scripted response: the outputs to yield, in order.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    pub outputs: Vec<ScriptedOutput>,
    /// Delay before each output is yielded.
    pub delay_per_output: Duration,
    /// Fail the stream after yielding all outputs.
    pub fail_at_end: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ScriptedOutput {
    Sentence(String),
    Tool { name: String, status: String },
}

impl ScriptedResponse {
    /// A response of plain sentences.
    pub fn sentences(texts: &[&str]) -> Self {
        Self {
            outputs: texts
                .iter()
                .map(|t| ScriptedOutput::Sentence(t.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_per_output = delay;
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.fail_at_end = Some(message.to_string());
        self
    }
}

/// Engine that replays a fixed script, one response per `chat` call.
/// Records every request and interrupt for assertions.
pub struct ScriptedEngine {
    script: Mutex<Vec<ScriptedResponse>>,
    requests: Mutex<Vec<AgentRequest>>,
    interrupts: Mutex<Vec<(ClientId, String)>>,
}

impl ScriptedEngine {
    pub fn new(script: Vec<ScriptedResponse>) -> Self {
        Self {
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
            interrupts: Mutex::new(Vec::new()),
        }
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// `(client, partial_text)` pairs recorded by `handle_interrupt`.
    pub fn interrupts(&self) -> Vec<(ClientId, String)> {
        self.interrupts.lock().expect("interrupts lock").clone()
    }
}

#[async_trait]
impl AgentEngine for ScriptedEngine {
    async fn chat(&self, request: AgentRequest) -> Result<AgentStream> {
        self.requests.lock().expect("requests lock").push(request);

        let response = {
            let mut script = self.script.lock().expect("script lock");
            if script.is_empty() {
                ScriptedResponse::sentences(&["I have nothing more to say."])
            } else {
                script.remove(0)
            }
        };

        let delay = response.delay_per_output;
        let fail = response.fail_at_end.clone();
        let mut items: Vec<Result<AgentOutput>> = response
            .outputs
            .into_iter()
            .map(|out| {
                Ok(match out {
                    ScriptedOutput::Sentence(text) => {
                        AgentOutput::Sentence(SentenceOutput::from_raw(&text))
                    }
                    ScriptedOutput::Tool { name, status } => {
                        AgentOutput::ToolStatus(ToolCallStatus {
                            name,
                            status,
                            detail: None,
                        })
                    }
                })
            })
            .collect();
        if let Some(message) = fail {
            items.push(Err(anyhow::anyhow!(message)));
        }

        let stream = stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(Box::pin(stream))
    }

    async fn handle_interrupt(&self, client: &ClientId, partial_text: &str) -> Result<()> {
        self.interrupts
            .lock()
            .expect("interrupts lock")
            .push((client.clone(), partial_text.to_string()));
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Engine that echoes the user's text back as a single sentence.
/// The default engine for offline runs.
pub struct EchoEngine;

#[async_trait]
impl AgentEngine for EchoEngine {
    async fn chat(&self, request: AgentRequest) -> Result<AgentStream> {
        let text = if request.user_text.trim().is_empty() {
            "I did not catch that.".to_string()
        } else {
            format!("You said: {}.", request.user_text.trim())
        };
        let sentence = AgentOutput::Sentence(SentenceOutput::from_raw(&text));
        Ok(Box::pin(stream::iter(vec![Ok(sentence)])))
    }

    async fn handle_interrupt(&self, _client: &ClientId, _partial_text: &str) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "echo"
    }
}
