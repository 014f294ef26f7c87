// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use penguin_config::ModelConfig;
use serde::{Deserialize, Serialize};

/// Lifecycle states.  `active ⇄ paused`; the other three are terminal and
/// never re-enter `active` — a new agent must be created instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Active,
    Paused,
    Cancelled,
    Failed,
    Completed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Failed | Self::Completed)
    }
}

/// What a new agent should look like.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Display descriptor ("researcher", "careful reviewer", ...).
    pub persona: Option<String>,
    /// Model selection; falls back to the runtime default when `None`.
    pub model: Option<ModelConfig>,
    /// Permitted tool names.  Empty means every registered handler.
    #[serde(default)]
    pub default_tools: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Bind to an existing session instead of creating a fresh one.
    pub session_id: Option<String>,
}

/// How a sub-agent's conversation relates to its parent's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSharing {
    /// Fresh, empty session.
    Isolated,
    /// One-time copy of the parent's branch head.
    Snapshot,
    /// Reads and appends the parent's session; the store's per-session
    /// append lock serializes the interleaving.
    Shared,
}

/// What `destroy` does to a destroyed agent's sub-agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CascadePolicy {
    /// Children keep running; their parent link is allowed to dangle.
    #[default]
    Orphan,
    /// Children are destroyed with the same history flag.
    Cascade,
}

/// An active participant: a named reasoning loop bound to a session.
#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub persona: Option<String>,
    /// Weak back-reference by id; never extends the parent's lifetime.
    pub parent_id: Option<String>,
    pub state: AgentState,
    pub is_sub_agent: bool,
    pub session_id: String,
    /// Whether destroying this agent may remove its session.  False for
    /// `shared` sub-agents and agents bound to a pre-existing session.
    pub owns_session: bool,
    pub model: ModelConfig,
    pub default_tools: Vec<String>,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
}
