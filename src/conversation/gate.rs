//! Request/response rendezvous between conversation flows and clients.
//!
//! A flow suspends on "a response of kind K (optionally matching
//! request-id R) from client C"; [`ResponseGate::deliver`] resumes it when
//! the response arrives. Responses with no registered waiter are dropped;
//! the protocol only uses responses a flow has already asked for, so a
//! flow registers *before* prompting the client and then awaits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use super::ClientId;
use crate::protocol::ClientMessage;

/// The kinds of client responses a flow can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    PlaybackComplete,
}

/// Composite key of one pending wait.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WaiterKey {
    client: ClientId,
    kind: ResponseKind,
    request_id: Option<String>,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<serde_json::Value>,
}

/// How a wait ended. Timeout and cancellation are distinct so the flow
/// can tell a slow client from a closed one.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Delivered(serde_json::Value),
    TimedOut,
    Cancelled,
}

/// A registered wait. Await it with [`PendingWait::wait`]; dropping it
/// (e.g. when the turn is cancelled) removes the registration.
pub struct PendingWait<'a> {
    gate: &'a ResponseGate,
    key: WaiterKey,
    id: u64,
    rx: Option<oneshot::Receiver<serde_json::Value>>,
}

impl PendingWait<'_> {
    /// Suspend until the response arrives, the timeout elapses, or the
    /// client is released. Returns exactly once.
    pub async fn wait(mut self, timeout: Option<Duration>) -> WaitOutcome {
        let rx = self.rx.take().expect("PendingWait polled once");
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(Ok(payload)) => WaitOutcome::Delivered(payload),
                Ok(Err(_)) => WaitOutcome::Cancelled,
                Err(_) => WaitOutcome::TimedOut,
            },
            None => match rx.await {
                Ok(payload) => WaitOutcome::Delivered(payload),
                Err(_) => WaitOutcome::Cancelled,
            },
        }
        // Drop removes the registration if it is still ours.
    }
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        // Only remove our own registration; a newer wait may have
        // replaced it under the same key.
        self.gate
            .waiters
            .remove_if(&self.key, |_, waiter| waiter.id == self.id);
    }
}

/// One-shot signal registry keyed by (client, kind, request-id).
#[derive(Default)]
pub struct ResponseGate {
    waiters: DashMap<WaiterKey, Waiter>,
    next_id: AtomicU64,
}

impl ResponseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait now so a prompt sent afterwards cannot race the
    /// response. A duplicate registration under the same key replaces
    /// the stale one, whose waiter observes cancellation.
    pub fn register(
        &self,
        client: &ClientId,
        kind: ResponseKind,
        request_id: Option<String>,
    ) -> PendingWait<'_> {
        let key = WaiterKey {
            client: client.clone(),
            kind,
            request_id,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(key.clone(), Waiter { id, tx });
        PendingWait {
            gate: self,
            key,
            id,
            rx: Some(rx),
        }
    }

    /// Register and await in one step.
    pub async fn wait(
        &self,
        client: &ClientId,
        kind: ResponseKind,
        request_id: Option<String>,
        timeout: Option<Duration>,
    ) -> WaitOutcome {
        self.register(client, kind, request_id).wait(timeout).await
    }

    /// Route an inbound message to its waiter, if any. Returns `true`
    /// when the message was consumed as a gate response.
    pub fn deliver(&self, client: &ClientId, message: &ClientMessage) -> bool {
        let (kind, request_id, payload) = match message {
            ClientMessage::FrontendPlaybackComplete { request_id } => (
                ResponseKind::PlaybackComplete,
                request_id.clone(),
                serde_json::Value::Null,
            ),
            _ => return false,
        };

        let key = WaiterKey {
            client: client.clone(),
            kind,
            request_id,
        };

        match self.waiters.remove(&key) {
            Some((_, waiter)) => {
                let _ = waiter.tx.send(payload);
            }
            None => {
                // Responses without a waiter are irrelevant to the
                // protocol and are not buffered.
                debug!(client = %client, ?kind, "response without waiter dropped");
            }
        }
        true
    }

    /// Unblock every pending wait for `client` with a cancellation
    /// result. Idempotent.
    pub fn release_client(&self, client: &ClientId) {
        // Dropping the senders wakes the receivers with a recv error,
        // which `wait` maps to `Cancelled`.
        self.waiters.retain(|key, _| key.client != *client);
    }

    /// Number of registered waiters (for tests and diagnostics).
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}
