// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use penguin_bus::{EventBus, EventPayload};
use penguin_config::{ConcurrentStreamPolicy, StreamConfig};
use penguin_model::{CancelToken, DeltaKind, EventStream, StreamEvent, Usage};
use tracing::warn;

/// Accumulated result of one consumed stream.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub content: String,
    pub reasoning: String,
    pub usage: Usage,
    /// True when the stream stopped on a cancellation signal.  Deltas
    /// emitted before the cancel remain valid.
    pub cancelled: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("a live stream already exists for {target}")]
    ConcurrentStream { target: String },
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

/// Splits a provider token stream into content and reasoning substreams.
///
/// Deltas are buffered per kind and flushed to the event bus either when
/// `coalesce_chars` are pending or `coalesce_ms` have elapsed, whichever
/// comes first; the final flush always drains both buffers.  A stream is
/// consumed exactly once, and only one live stream may exist per target —
/// the constructor-chosen policy either cancels the previous stream
/// deterministically or refuses the new one.
pub struct StreamMultiplexer {
    events: Arc<EventBus>,
    cfg: StreamConfig,
    live: Mutex<HashMap<String, (u64, CancelToken)>>,
    next_guard: AtomicU64,
}

impl StreamMultiplexer {
    pub fn new(events: Arc<EventBus>, cfg: StreamConfig) -> Self {
        Self {
            events,
            cfg,
            live: Mutex::new(HashMap::new()),
            next_guard: AtomicU64::new(1),
        }
    }

    /// Consume `stream` to completion, emitting coalesced events for
    /// `agent_id`/`session_id`.  `cancel` stops emission at the next chunk
    /// boundary and publishes `stream.cancelled`.
    pub async fn run(
        &self,
        agent_id: &str,
        session_id: &str,
        stream: EventStream,
        cancel: &CancelToken,
    ) -> Result<StreamOutcome, StreamError> {
        let guard_id = self.next_guard.fetch_add(1, Ordering::Relaxed);
        let stream_cancel = cancel.child();
        {
            let mut live = self.live.lock().unwrap();
            if let Some((_, previous)) = live.get(agent_id) {
                match self.cfg.concurrent_policy {
                    ConcurrentStreamPolicy::Fail => {
                        return Err(StreamError::ConcurrentStream {
                            target: agent_id.to_string(),
                        });
                    }
                    ConcurrentStreamPolicy::CancelPrevious => {
                        // Deterministic: the old stream observes its token
                        // before the new one emits anything, because we
                        // replace the slot while holding the lock.
                        previous.cancel();
                    }
                }
            }
            live.insert(agent_id.to_string(), (guard_id, stream_cancel.clone()));
        }

        let result = self
            .pump(agent_id, session_id, stream, &stream_cancel)
            .await;

        let mut live = self.live.lock().unwrap();
        if live.get(agent_id).map(|(id, _)| *id) == Some(guard_id) {
            live.remove(agent_id);
        }
        result
    }

    async fn pump(
        &self,
        agent_id: &str,
        session_id: &str,
        mut stream: EventStream,
        cancel: &CancelToken,
    ) -> Result<StreamOutcome, StreamError> {
        self.events
            .publish(agent_id, session_id, EventPayload::StreamStart);

        let mut outcome = StreamOutcome::default();
        let mut pending_content = String::new();
        let mut pending_reasoning = String::new();
        let mut last_flush = Instant::now();
        let coalesce_window = Duration::from_millis(self.cfg.coalesce_ms);

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                item = stream.next() => item,
            };

            let Some(item) = item else { break };
            match item {
                Ok(StreamEvent::Delta { text, kind }) => {
                    match kind {
                        DeltaKind::Content => {
                            outcome.content.push_str(&text);
                            pending_content.push_str(&text);
                        }
                        DeltaKind::Reasoning => {
                            outcome.reasoning.push_str(&text);
                            pending_reasoning.push_str(&text);
                        }
                    }
                    let due = pending_content.len() >= self.cfg.coalesce_chars
                        || pending_reasoning.len() >= self.cfg.coalesce_chars
                        || last_flush.elapsed() >= coalesce_window;
                    if due {
                        self.flush(
                            agent_id,
                            session_id,
                            &mut pending_content,
                            &mut pending_reasoning,
                        );
                        last_flush = Instant::now();
                    }
                }
                Ok(StreamEvent::Usage(usage)) => outcome.usage = usage,
                Ok(StreamEvent::Done) => break,
                Ok(StreamEvent::Error(msg)) => {
                    warn!(agent = %agent_id, "model stream warning: {msg}");
                }
                Err(e) => {
                    // Hard mid-stream failure: drain what we have so the
                    // caller can decide, then surface the error.
                    self.flush(
                        agent_id,
                        session_id,
                        &mut pending_content,
                        &mut pending_reasoning,
                    );
                    return Err(StreamError::Provider(e));
                }
            }
        }

        // Final flush is guaranteed: subscribers always see every delta
        // that arrived before the stop.
        self.flush(
            agent_id,
            session_id,
            &mut pending_content,
            &mut pending_reasoning,
        );

        if outcome.cancelled {
            self.events
                .publish(agent_id, session_id, EventPayload::StreamCancelled);
        } else {
            self.events.publish(
                agent_id,
                session_id,
                EventPayload::StreamEnd {
                    usage: outcome.usage,
                },
            );
        }
        Ok(outcome)
    }

    fn flush(
        &self,
        agent_id: &str,
        session_id: &str,
        pending_content: &mut String,
        pending_reasoning: &mut String,
    ) {
        if !pending_content.is_empty() {
            self.events.publish(
                agent_id,
                session_id,
                EventPayload::StreamChunk {
                    text: std::mem::take(pending_content),
                },
            );
        }
        if !pending_reasoning.is_empty() {
            self.events.publish(
                agent_id,
                session_id,
                EventPayload::StreamReasoning {
                    text: std::mem::take(pending_reasoning),
                },
            );
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
