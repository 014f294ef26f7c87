// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    CancelToken, DeltaKind, EventStream, GatewayRequest, ModelGateway, Role, StreamEvent, Usage,
};

/// Deterministic mock gateway for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockGateway;

#[async_trait]
impl ModelGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(
        &self,
        req: GatewayRequest,
        _cancel: CancelToken,
    ) -> anyhow::Result<EventStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.to_text())
            .unwrap_or_else(|| "[no input]".into());

        let events: Vec<anyhow::Result<StreamEvent>> = vec![
            Ok(StreamEvent::Delta {
                text: format!("MOCK: {reply}"),
                kind: DeltaKind::Content,
            }),
            Ok(StreamEvent::Usage(Usage {
                input_tokens: 10,
                output_tokens: 10,
            })),
            Ok(StreamEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One scripted gateway call.
#[derive(Debug, Clone)]
pub enum ScriptedCall {
    /// Emit this exact event sequence.
    Events(Vec<StreamEvent>),
    /// Fail the `stream()` call itself with this error message.  Used to
    /// exercise the engine's retry/backoff path.
    Fail(String),
}

/// A pre-scripted gateway.  Each call to `stream` pops the next script from
/// the front of the queue, so tests can specify exact event sequences —
/// including reasoning deltas and injected failures — without network
/// access.
pub struct ScriptedGateway {
    scripts: Mutex<Vec<ScriptedCall>>,
    /// The last `GatewayRequest` seen.  Written on each `stream()` call so
    /// tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<GatewayRequest>>>,
    /// Total number of `stream()` calls made.
    pub calls: Arc<Mutex<u32>>,
}

impl ScriptedGateway {
    /// Build a gateway from an ordered list of per-call scripts.
    pub fn new(scripts: Vec<ScriptedCall>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            last_request: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Convenience: gateway whose every call emits the given content deltas
    /// followed by usage and `Done`.
    pub fn always_deltas(deltas: Vec<&str>) -> Self {
        let mut events: Vec<StreamEvent> = deltas
            .into_iter()
            .map(|d| StreamEvent::Delta {
                text: d.to_string(),
                kind: DeltaKind::Content,
            })
            .collect();
        events.push(StreamEvent::Usage(Usage {
            input_tokens: 5,
            output_tokens: 5,
        }));
        events.push(StreamEvent::Done);
        Self::new(vec![ScriptedCall::Events(events)])
    }

    /// Convenience: a single call returning one text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![ScriptedCall::Events(vec![
            StreamEvent::Delta {
                text: reply.into(),
                kind: DeltaKind::Content,
            },
            StreamEvent::Usage(Usage {
                input_tokens: 5,
                output_tokens: 5,
            }),
            StreamEvent::Done,
        ])])
    }

    /// Convenience: script for one call that interleaves reasoning and
    /// content deltas.
    pub fn reasoning_then_text(
        reasoning: impl Into<String>,
        text: impl Into<String>,
    ) -> ScriptedCall {
        ScriptedCall::Events(vec![
            StreamEvent::Delta {
                text: reasoning.into(),
                kind: DeltaKind::Reasoning,
            },
            StreamEvent::Delta {
                text: text.into(),
                kind: DeltaKind::Content,
            },
            StreamEvent::Done,
        ])
    }

    /// Convenience: script for one call that returns plain text.
    pub fn text_call(text: impl Into<String>) -> ScriptedCall {
        ScriptedCall::Events(vec![
            StreamEvent::Delta {
                text: text.into(),
                kind: DeltaKind::Content,
            },
            StreamEvent::Done,
        ])
    }

    /// Convenience: script for one call that returns nothing but `Done`.
    pub fn empty_call() -> ScriptedCall {
        ScriptedCall::Events(vec![StreamEvent::Done])
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn stream(
        &self,
        req: GatewayRequest,
        _cancel: CancelToken,
    ) -> anyhow::Result<EventStream> {
        *self.last_request.lock().unwrap() = Some(req);
        *self.calls.lock().unwrap() += 1;

        let next = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                ScriptedCall::Events(vec![StreamEvent::Done])
            } else {
                scripts.remove(0)
            }
        };

        match next {
            ScriptedCall::Fail(msg) => Err(anyhow::anyhow!(msg)),
            ScriptedCall::Events(events) => {
                let items: Vec<anyhow::Result<StreamEvent>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(items)))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
