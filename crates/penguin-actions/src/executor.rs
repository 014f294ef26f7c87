// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use penguin_config::EngineConfig;
use penguin_model::CancelToken;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::handler::{ActionHandler, ExecutionContext};
use crate::parser::{Action, ActionErrorKind};
use crate::truncate::{strip_ansi, truncate_output};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Completed,
    Failed,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Normalised result of one action execution.
#[derive(Debug, Clone)]
pub struct ActionResult {
    /// Name of the action this result answers.
    pub action: String,
    pub status: ActionStatus,
    /// Captured output, ANSI-stripped and bounded by the output cap.
    pub output: String,
    pub duration_ms: u64,
    /// Stable failure kind on `Failed`/`Cancelled`.
    pub error_kind: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Dispatches parsed actions to registered handlers.
///
/// Every handler invocation runs under the per-action timeout and a
/// cancellation token derived from the enclosing engine run; the executor
/// itself never panics and never blocks past the timeout.
pub struct ActionExecutor {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    timeout: Duration,
    output_cap_bytes: usize,
}

impl ActionExecutor {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            timeout: Duration::from_secs(cfg.action_timeout_secs),
            output_cap_bytes: cfg.action_output_cap_bytes,
        }
    }

    pub fn register(&mut self, handler: impl ActionHandler + 'static) {
        self.handlers
            .insert(handler.name().to_string(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether this action requires host approval before execution.
    pub fn needs_approval(&self, name: &str) -> bool {
        self.handlers
            .get(name)
            .map(|h| h.needs_approval())
            .unwrap_or(false)
    }

    /// Execute one action to a normalised result.  Parse errors recorded on
    /// the action surface here, not at parse time.
    pub async fn execute(
        &self,
        action: &Action,
        ctx: &ExecutionContext,
        cancel: CancelToken,
    ) -> ActionResult {
        let started = Instant::now();

        if let Some(kind) = action.error_kind {
            return ActionResult {
                action: action.name.clone(),
                status: ActionStatus::Failed,
                output: format!(
                    "action <{}> at byte {} was not terminated before end of message",
                    action.name, action.span.0
                ),
                duration_ms: 0,
                error_kind: Some(kind.as_str().to_string()),
                metadata: serde_json::Map::new(),
            };
        }

        let Some(handler) = self.handlers.get(&action.name) else {
            return ActionResult {
                action: action.name.clone(),
                status: ActionStatus::Failed,
                output: format!("unknown action: {}", action.name),
                duration_ms: 0,
                error_kind: Some("unknown_action".into()),
                metadata: serde_json::Map::new(),
            };
        };

        if cancel.is_cancelled() {
            return self.cancelled_result(action, started);
        }

        debug!(action = %action.name, "executing action");
        let action_cancel = cancel.child();
        let work = handler.execute(&action.params, ctx, action_cancel.clone());

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Give the handler its own signal; if it cannot preempt,
                // the observation records cancellation as pending.
                action_cancel.cancel();
                return self.cancelled_result(action, started);
            }
            result = tokio::time::timeout(self.timeout, work) => result,
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Err(_) => {
                warn!(action = %action.name, timeout_secs = self.timeout.as_secs(),
                    "action timed out");
                ActionResult {
                    action: action.name.clone(),
                    status: ActionStatus::Failed,
                    output: format!("timeout after {}s", self.timeout.as_secs()),
                    duration_ms,
                    error_kind: Some("timeout".into()),
                    metadata: serde_json::Map::new(),
                }
            }
            Ok(Err(e)) => ActionResult {
                action: action.name.clone(),
                status: ActionStatus::Failed,
                output: format!("{e:#}"),
                duration_ms,
                error_kind: Some("execution_error".into()),
                metadata: serde_json::Map::new(),
            },
            Ok(Ok(outcome)) => {
                let mut metadata = outcome.metadata;
                if !handler.idempotent() {
                    metadata.insert(
                        "effect_id".into(),
                        effect_fingerprint(&action.name, &action.params).into(),
                    );
                }
                let cleaned = strip_ansi(&outcome.output);
                ActionResult {
                    action: action.name.clone(),
                    status: ActionStatus::Completed,
                    output: truncate_output(&cleaned, self.output_cap_bytes),
                    duration_ms,
                    error_kind: None,
                    metadata,
                }
            }
        }
    }

    fn cancelled_result(&self, action: &Action, started: Instant) -> ActionResult {
        let mut metadata = serde_json::Map::new();
        metadata.insert("cancellation".into(), "pending".into());
        ActionResult {
            action: action.name.clone(),
            status: ActionStatus::Cancelled,
            output: "[cancelled before completion]".into(),
            duration_ms: started.elapsed().as_millis() as u64,
            error_kind: Some("cancelled".into()),
            metadata,
        }
    }
}

/// SHA-256 over `(name, params)`, recorded on non-idempotent results so a
/// replayed action can be recognised.
fn effect_fingerprint(name: &str, params: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(params.as_bytes());
    hex::encode(hasher.finalize())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
