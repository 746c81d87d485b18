//! Ordered parallel TTS for one speaking turn.
//!
//! Sentences are synthesized concurrently (bounded by a semaphore) but
//! delivered to the client strictly in submission order: a single sender
//! loop holds completed payloads in a reorder buffer and never advances
//! past a gap. A failed synthesis closes its gap with an empty-audio
//! sentinel so the stream cannot stall.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::Recipients;
use crate::agent::{PrerenderedAudio, SentenceOutput};
use crate::protocol::{Actions, ServerMessage};
use crate::provider::{TtsProvider, TtsResult};

/// A payload ready for ordered delivery.
#[derive(Debug, Clone)]
struct AudioFrame {
    audio_b64: String,
    display_text: String,
    actions: Option<Actions>,
}

impl AudioFrame {
    fn synthesized(sentence: &SentenceOutput, result: &TtsResult) -> Self {
        Self {
            audio_b64: BASE64.encode(&result.audio),
            display_text: sentence.display_text.clone(),
            actions: sentence.actions.clone(),
        }
    }

    /// Gap-closing sentinel for a failed synthesis: empty audio, original
    /// display text.
    fn sentinel(sentence: &SentenceOutput) -> Self {
        Self {
            audio_b64: String::new(),
            display_text: sentence.display_text.clone(),
            actions: sentence.actions.clone(),
        }
    }

    fn prerendered(audio: &PrerenderedAudio) -> Self {
        Self {
            audio_b64: BASE64.encode(&audio.audio),
            display_text: audio.display_text.clone(),
            actions: audio.actions.clone(),
        }
    }

    fn into_message(self, sequence: u64) -> ServerMessage {
        ServerMessage::AudioResponse {
            audio: self.audio_b64,
            display_text: self.display_text,
            actions: self.actions.filter(|a| !a.is_empty()),
            sequence,
        }
    }
}

/// Serializes parallel synthesis into in-order audio delivery.
///
/// Owned by exactly one turn task; `clear` makes it reusable for the
/// next turn of the same flow.
pub struct OrderedTtsManager {
    tts: Arc<dyn TtsProvider>,
    sink: Recipients,
    semaphore: Arc<Semaphore>,
    parent_cancel: CancellationToken,
    cancel: CancellationToken,
    next_seq: u64,
    completion_tx: Option<mpsc::UnboundedSender<(u64, AudioFrame)>>,
    delivered: Option<watch::Receiver<u64>>,
    sender: Option<JoinHandle<()>>,
    tracker: TaskTracker,
}

impl OrderedTtsManager {
    pub fn new(
        tts: Arc<dyn TtsProvider>,
        sink: Recipients,
        max_concurrent: usize,
        parent_cancel: &CancellationToken,
    ) -> Self {
        Self {
            tts,
            sink,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            parent_cancel: parent_cancel.clone(),
            cancel: parent_cancel.child_token(),
            next_seq: 0,
            completion_tx: None,
            delivered: None,
            sender: None,
            tracker: TaskTracker::new(),
        }
    }

    /// Sequence numbers handed out so far this turn.
    pub fn submitted(&self) -> u64 {
        self.next_seq
    }

    /// Queue one sentence: assigns the next sequence number, starts a
    /// background synthesis, and returns immediately.
    pub fn speak(&mut self, sentence: SentenceOutput) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let completion_tx = self.ensure_sender();

        let tts = Arc::clone(&self.tts);
        let semaphore = Arc::clone(&self.semaphore);
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = semaphore.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
            };

            debug!(seq, text = %sentence.tts_text, "synthesis started");

            let frame = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tts.synthesize(&sentence.tts_text) => match result {
                    Ok(audio) => {
                        debug!(seq, "synthesis completed");
                        AudioFrame::synthesized(&sentence, &audio)
                    }
                    Err(e) => {
                        warn!(seq, error = %e, "synthesis failed, emitting sentinel");
                        AudioFrame::sentinel(&sentence)
                    }
                },
            };

            let _ = completion_tx.send((seq, frame));
        });
    }

    /// Queue audio the engine already rendered, through the same
    /// sequence-assigning path so ordering stays serialized.
    pub fn speak_prerendered(&mut self, audio: PrerenderedAudio) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let completion_tx = self.ensure_sender();
        let _ = completion_tx.send((seq, AudioFrame::prerendered(&audio)));
    }

    /// Suspend until everything submitted so far has been delivered in
    /// order, or the turn is cancelled.
    pub async fn drain(&mut self) {
        let target = self.next_seq;
        if target == 0 {
            return;
        }
        let Some(mut delivered) = self.delivered.clone() else {
            return;
        };

        loop {
            if *delivered.borrow_and_update() >= target {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = delivered.changed() => {
                    if changed.is_err() {
                        return; // sender loop gone
                    }
                }
            }
        }
    }

    /// Cancel the sender loop and every outstanding synthesis, empty the
    /// reorder buffer, and reset the sequence counter. Idempotent; the
    /// manager is reusable for a new turn afterwards.
    pub async fn clear(&mut self) {
        self.cancel.cancel();
        self.completion_tx = None;
        self.delivered = None;
        if let Some(sender) = self.sender.take() {
            let _ = sender.await;
        }
        self.tracker.close();
        self.tracker.wait().await;

        self.tracker = TaskTracker::new();
        self.cancel = self.parent_cancel.child_token();
        self.next_seq = 0;
    }

    /// Start the sender loop on first use.
    fn ensure_sender(&mut self) -> mpsc::UnboundedSender<(u64, AudioFrame)> {
        if let Some(tx) = &self.completion_tx {
            return tx.clone();
        }

        let (completion_tx, mut completion_rx) = mpsc::unbounded_channel::<(u64, AudioFrame)>();
        let (delivered_tx, delivered_rx) = watch::channel(0u64);
        let sink = self.sink.clone();
        let cancel = self.cancel.clone();

        let sender = tokio::spawn(async move {
            let mut next_to_send: u64 = 0;
            let mut buffer: HashMap<u64, AudioFrame> = HashMap::new();

            loop {
                let (seq, frame) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = completion_rx.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };

                buffer.insert(seq, frame);

                // Drain consecutively; never advance past a gap.
                while let Some(frame) = buffer.remove(&next_to_send) {
                    sink.send(&frame.into_message(next_to_send));
                    next_to_send += 1;
                    let _ = delivered_tx.send(next_to_send);
                }
            }
        });

        self.completion_tx = Some(completion_tx.clone());
        self.delivered = Some(delivered_rx);
        self.sender = Some(sender);
        completion_tx
    }
}
