// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use async_trait::async_trait;
use penguin_model::CancelToken;

/// Ambient information handed to every action handler.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub agent_id: String,
    pub session_id: String,
    pub workdir: Option<PathBuf>,
}

impl ExecutionContext {
    /// Environment for external subprocesses.  Terminal formatting is
    /// neutralised so captured output is plain text: most tools check
    /// `NO_COLOR`/`TERM` before emitting ANSI sequences.
    pub fn subprocess_env(&self) -> Vec<(String, String)> {
        vec![
            ("NO_COLOR".into(), "1".into()),
            ("TERM".into(), "dumb".into()),
            ("CLICOLOR".into(), "0".into()),
            ("CLICOLOR_FORCE".into(), "0".into()),
        ]
    }
}

/// What a handler produced.  `output` is captured verbatim; the executor
/// applies truncation and ANSI stripping afterwards.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    pub output: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl HandlerOutcome {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A registered action capability.  Handlers must not block indefinitely:
/// long-running work should check `cancel` between steps, and everything
/// runs under the executor's per-action timeout regardless.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Advisory parameter micro-schema, used for help text.
    fn param_hint(&self) -> &str {
        ""
    }

    /// Whether invocations must be approved by the host before running.
    fn needs_approval(&self) -> bool {
        false
    }

    /// Handlers with external side effects return `false`; the executor
    /// then records an effect fingerprint in the result metadata so replays
    /// can be detected.
    fn idempotent(&self) -> bool {
        true
    }

    /// Run the action.  Errors become failed observations, never panics.
    async fn execute(
        &self,
        params: &str,
        ctx: &ExecutionContext,
        cancel: CancelToken,
    ) -> anyhow::Result<HandlerOutcome>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
