//! Persistent conversation history and retrieval.
//!
//! History is line-oriented: one `"<speaker>: <text>"` line per utterance,
//! with markers such as `[Interrupted by user]` stored as their own
//! appended lines so parsers stay line-oriented.

pub mod search;

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::conversation::ClientId;

pub use search::{score_line, MemoryFragment};

/// Speaker label used for the human side of history lines.
const USER_LABEL: &str = "User";

/// Max fragments returned by retrieval.
const RETRIEVE_LIMIT: usize = 5;

/// Store of per-client conversation history with naive retrieval.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one user utterance.
    async fn append_user(&self, client: &ClientId, text: &str) -> Result<()>;

    /// Append one assistant response, plus zero or more marker lines.
    async fn append_assistant(&self, client: &ClientId, text: &str, markers: &[&str])
        -> Result<()>;

    /// Retrieve history fragments relevant to `query`, best first.
    async fn retrieve(&self, client: &ClientId, query: &str) -> Result<Vec<MemoryFragment>>;

    /// All history lines for a client, in order.
    async fn lines(&self, client: &ClientId) -> Result<Vec<String>>;
}

fn assistant_lines(assistant_label: &str, text: &str, markers: &[&str]) -> Vec<String> {
    let mut lines = vec![format!("{assistant_label}: {text}")];
    for marker in markers {
        lines.push((*marker).to_string());
    }
    lines
}

fn retrieve_from(lines: &[String], query: &str) -> Vec<MemoryFragment> {
    let mut scored: Vec<MemoryFragment> = lines
        .iter()
        .filter_map(|line| {
            let score = score_line(line, query);
            (score > 0.0).then(|| MemoryFragment {
                source: "history".to_string(),
                content: line.clone(),
                score,
            })
        })
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(RETRIEVE_LIMIT);
    scored
}

// ── In-memory store ──────────────────────────────────────────────

/// Volatile history store, used by tests and as a no-persistence mode.
pub struct InMemoryHistory {
    assistant_label: String,
    entries: DashMap<ClientId, Vec<String>>,
}

impl InMemoryHistory {
    pub fn new(assistant_label: &str) -> Self {
        Self {
            assistant_label: assistant_label.to_string(),
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn append_user(&self, client: &ClientId, text: &str) -> Result<()> {
        self.entries
            .entry(client.clone())
            .or_default()
            .push(format!("{USER_LABEL}: {text}"));
        Ok(())
    }

    async fn append_assistant(
        &self,
        client: &ClientId,
        text: &str,
        markers: &[&str],
    ) -> Result<()> {
        self.entries
            .entry(client.clone())
            .or_default()
            .extend(assistant_lines(&self.assistant_label, text, markers));
        Ok(())
    }

    async fn retrieve(&self, client: &ClientId, query: &str) -> Result<Vec<MemoryFragment>> {
        let lines = self
            .entries
            .get(client)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        Ok(retrieve_from(&lines, query))
    }

    async fn lines(&self, client: &ClientId) -> Result<Vec<String>> {
        Ok(self
            .entries
            .get(client)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }
}

// ── File-backed store ────────────────────────────────────────────

/// Markdown-file history store: one `<client>.md` per client under the
/// data directory, one history line per file line.
pub struct FileHistory {
    assistant_label: String,
    data_dir: PathBuf,
}

impl FileHistory {
    pub async fn open(data_dir: impl Into<PathBuf>, assistant_label: &str) -> Result<Self> {
        let data_dir = data_dir.into();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create history dir {}", data_dir.display()))?;
        Ok(Self {
            assistant_label: assistant_label.to_string(),
            data_dir,
        })
    }

    fn path_for(&self, client: &ClientId) -> PathBuf {
        // Client ids are uuids or caller-chosen handles; keep the file
        // name safe regardless.
        let safe: String = client
            .as_str()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.data_dir.join(format!("{safe}.md"))
    }

    async fn append_lines(&self, client: &ClientId, lines: &[String]) -> Result<()> {
        let path = self.path_for(client);
        let is_new = !tokio::fs::try_exists(&path).await.unwrap_or(false);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;

        let mut block = String::new();
        if is_new {
            block.push_str(&format!(
                "# Conversation log for {client}, created {}\n",
                chrono::Local::now().to_rfc3339()
            ));
        }
        block.push_str(&lines.join("\n"));
        block.push('\n');
        file.write_all(block.as_bytes())
            .await
            .with_context(|| format!("failed to append to {}", path.display()))?;
        file.flush().await.with_context(|| format!("failed to flush {}", path.display()))?;
        debug!(client = %client, lines = lines.len(), "history appended");
        Ok(())
    }

    async fn read_lines(&self, client: &ClientId) -> Result<Vec<String>> {
        let path = self.path_for(client);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content
                .lines()
                .filter(|l| !l.starts_with('#') && !l.trim().is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}

#[async_trait]
impl HistoryStore for FileHistory {
    async fn append_user(&self, client: &ClientId, text: &str) -> Result<()> {
        self.append_lines(client, &[format!("{USER_LABEL}: {text}")])
            .await
    }

    async fn append_assistant(
        &self,
        client: &ClientId,
        text: &str,
        markers: &[&str],
    ) -> Result<()> {
        self.append_lines(client, &assistant_lines(&self.assistant_label, text, markers))
            .await
    }

    async fn retrieve(&self, client: &ClientId, query: &str) -> Result<Vec<MemoryFragment>> {
        let lines = self.read_lines(client).await?;
        Ok(retrieve_from(&lines, query))
    }

    async fn lines(&self, client: &ClientId) -> Result<Vec<String>> {
        self.read_lines(client).await
    }
}
