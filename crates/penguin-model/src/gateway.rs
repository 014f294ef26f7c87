// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use penguin_config::ModelConfig;

use crate::{CancelToken, Message, Usage};

/// Distinguishes the two token kinds a model may interleave in one
/// response.  They are buffered and emitted separately end to end; merging
/// them into one stream is lossy and not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Content,
    Reasoning,
}

/// A single streamed event from the gateway.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A token delta of the given kind.
    Delta { text: String, kind: DeltaKind },
    /// Final usage statistics for the completion.
    Usage(Usage),
    /// The stream finished normally.
    Done,
    /// A recoverable provider warning (non-fatal).
    Error(String),
}

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// Request sent to the gateway: the projected context plus the model
/// selection.  Provider-specific translation happens behind the trait; the
/// core never learns provider identities.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub messages: Vec<Message>,
    pub model: ModelConfig,
}

/// The narrow interface the engine consumes for LLM invocation.
///
/// `cancel` must be honoured at chunk granularity: once it fires, the
/// returned stream should end promptly (with or without a final `Done`).
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Human-readable gateway name for diagnostics.
    fn name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn stream(&self, req: GatewayRequest, cancel: CancelToken)
        -> anyhow::Result<EventStream>;

    /// Context window of the selected model, when the gateway knows it.
    /// Used as a ceiling check on the projected context.
    fn context_window(&self) -> Option<u32> {
        None
    }
}
