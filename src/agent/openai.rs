//! OpenAI-compatible streaming engine.
//!
//! Speaks the `/chat/completions` SSE protocol, so any compatible server
//! (llama.cpp, vLLM, Ollama, the hosted API) can back a conversation.
//! Tokens are sentence-split before they reach the orchestrator.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::splitter::SentenceSplitter;
use super::{AgentEngine, AgentOutput, AgentRequest, AgentStream};
use crate::conversation::ClientId;

/// How many prior exchanges to replay per request.
const DEFAULT_MAX_LOG_MESSAGES: usize = 20;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Base URL without trailing slash, e.g. `http://localhost:11434/v1`.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_log_messages: usize,
}

impl OpenAiConfig {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: None,
            max_log_messages: DEFAULT_MAX_LOG_MESSAGES,
        }
    }
}

#[derive(Debug, Clone)]
struct LogEntry {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Streaming chat-completions engine with a per-client short-term log.
pub struct OpenAiEngine {
    http: reqwest::Client,
    config: OpenAiConfig,
    log: Arc<DashMap<ClientId, Vec<LogEntry>>>,
}

impl OpenAiEngine {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            log: Arc::new(DashMap::new()),
        }
    }

    fn push_log(&self, client: &ClientId, role: &'static str, content: String) {
        let mut entries = self.log.entry(client.clone()).or_default();
        entries.push(LogEntry { role, content });
        let max = self.config.max_log_messages;
        let len = entries.len();
        if len > max {
            entries.drain(..len - max);
        }
    }

    fn build_messages(&self, request: &AgentRequest) -> Vec<serde_json::Value> {
        let mut system = request.system_prompt.clone();
        if !request.context.is_empty() {
            system.push_str("\n\nRelevant memory:\n");
            for fragment in &request.context {
                system.push_str("- ");
                system.push_str(&fragment.content);
                system.push('\n');
            }
        }

        let mut messages = vec![json!({ "role": "system", "content": system })];
        if let Some(entries) = self.log.get(&request.client) {
            for entry in entries.iter() {
                messages.push(json!({ "role": entry.role, "content": entry.content }));
            }
        }
        messages.push(json!({ "role": "user", "content": request.user_text }));
        messages
    }
}

#[async_trait]
impl AgentEngine for OpenAiEngine {
    async fn chat(&self, request: AgentRequest) -> Result<AgentStream> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = json!({
            "model": self.config.model,
            "messages": self.build_messages(&request),
            "stream": true,
        });

        let mut http_request = self.http.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request
            .send()
            .await
            .context("chat completions request failed")?
            .error_for_status()
            .context("chat completions returned an error status")?;

        if !request.metadata.skip_history {
            self.push_log(&request.client, "user", request.user_text.clone());
        }

        let (token_tx, token_rx) = mpsc::channel::<Result<String>>(32);
        let client = request.client.clone();
        let record = !request.metadata.skip_history;
        let log_handle = self.log.clone();
        let max_log = self.config.max_log_messages;

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut pending = String::new();
            let mut full = String::new();

            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = token_tx.send(Err(e.into())).await;
                        return;
                    }
                };
                pending.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(line_end) = pending.find('\n') {
                    let line: String = pending.drain(..=line_end).collect();
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        break 'outer;
                    }
                    match serde_json::from_str::<StreamChunk>(data) {
                        Ok(parsed) => {
                            let token = parsed
                                .choices
                                .first()
                                .and_then(|c| c.delta.content.clone())
                                .unwrap_or_default();
                            if token.is_empty() {
                                continue;
                            }
                            full.push_str(&token);
                            if token_tx.send(Ok(token)).await.is_err() {
                                // Consumer gone (turn cancelled); the
                                // truncation is recorded via handle_interrupt.
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "unparseable stream chunk skipped");
                        }
                    }
                }
            }

            if record && !full.is_empty() {
                let mut entries = log_handle.entry(client).or_default();
                entries.push(LogEntry {
                    role: "assistant",
                    content: full,
                });
                let len = entries.len();
                if len > max_log {
                    entries.drain(..len - max_log);
                }
            }
        });

        let tokens = Box::pin(tokio_stream::wrappers::ReceiverStream::new(token_rx));
        let sentences = SentenceSplitter::default().split(tokens);
        Ok(Box::pin(
            sentences.map(|item| item.map(AgentOutput::Sentence)),
        ))
    }

    async fn handle_interrupt(&self, client: &ClientId, partial_text: &str) -> Result<()> {
        warn!(client = %client, "recording truncated response");
        self.push_log(
            client,
            "assistant",
            format!("{partial_text} [response was interrupted]"),
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "openai"
    }
}
