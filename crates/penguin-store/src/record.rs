// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! On-disk record format for conversation state.
//!
//! This module is the single place the persistence layout is defined.
//! One directory per session under the workspace root:
//!
//! - `messages.jsonl` — append-only, one JSON object per line, three
//!   shapes discriminated by `"op"`:
//!   - `{"op":"append","v":1,...message fields...,"pinned":false}`
//!   - `{"op":"replace","v":1,"replaced":N,...message fields...}` —
//!     replay tombstones message `N` and appends the edited message.
//!   - `{"op":"rollback","v":1,"head":N}` — replay tombstones every
//!     message with `id > N` and resets the id counter to `N + 1`.
//! - `checkpoints.json` — rewritten on change; a JSON array of versioned
//!   checkpoint records.
//!
//! Every record carries a schema version `"v"` and an `extra` flatten map,
//! so fields written by a newer build survive a load/re-serialize cycle
//! unchanged.

use penguin_model::Message;
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;

pub const SCHEMA_VERSION: u32 = 1;

fn schema_version() -> u32 {
    SCHEMA_VERSION
}

/// One line of `messages.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogRecord {
    Append(AppendRecord),
    Replace(ReplaceRecord),
    Rollback(RollbackRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRecord {
    #[serde(default = "schema_version")]
    pub v: u32,
    #[serde(flatten)]
    pub message: Message,
    #[serde(default)]
    pub pinned: bool,
    /// Unknown fields, preserved across re-serialization.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceRecord {
    #[serde(default = "schema_version")]
    pub v: u32,
    /// Id of the message this edit supersedes.
    pub replaced: u64,
    #[serde(flatten)]
    pub message: Message,
    #[serde(default)]
    pub pinned: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    #[serde(default = "schema_version")]
    pub v: u32,
    /// Branch head after the rollback.
    pub head: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One element of the `checkpoints.json` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    #[serde(default = "schema_version")]
    pub v: u32,
    #[serde(flatten)]
    pub checkpoint: Checkpoint,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
