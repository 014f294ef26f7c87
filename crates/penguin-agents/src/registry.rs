// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use penguin_bus::{EventBus, EventPayload, MessageBus};
use penguin_config::ModelConfig;
use penguin_store::{CheckpointKind, ConversationStore, StoreError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentSpec, AgentState, CascadePolicy, ContextSharing};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no such agent: {0}")]
    UnknownAgent(String),
    #[error("invalid state transition for {agent}: {from:?} → {to:?}")]
    InvalidTransition {
        agent: String,
        from: AgentState,
        to: AgentState,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Filter for `list`.  Empty matches every agent.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub state: Option<AgentState>,
    pub role: Option<String>,
}

/// Owns every agent record and drives the lifecycle state machine.
///
/// Sessions are referenced by id; parent/child links are ids too, so no
/// cycle of owning pointers can form.  All mutation goes through `&self`
/// methods behind one lock — the registry is shared as `Arc<AgentRegistry>`
/// across engine loops.
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, Agent>>,
    store: Arc<ConversationStore>,
    bus: Arc<MessageBus>,
    events: Arc<EventBus>,
    default_model: ModelConfig,
}

impl AgentRegistry {
    pub fn new(
        store: Arc<ConversationStore>,
        bus: Arc<MessageBus>,
        events: Arc<EventBus>,
        default_model: ModelConfig,
    ) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            store,
            bus,
            events,
            default_model,
        }
    }

    /// Create an agent from `spec`.  Binds the given session or creates a
    /// fresh one, registers the agent on the message bus, and announces it.
    pub fn create(&self, spec: AgentSpec) -> Result<String, RegistryError> {
        let id = Uuid::new_v4().to_string();
        let (session_id, owns_session) = match &spec.session_id {
            Some(sid) => {
                // Must exist; a typo here should fail loudly, not mint a session.
                self.store.head(sid)?;
                (sid.clone(), false)
            }
            None => (self.store.create_session()?, true),
        };
        let agent = Agent {
            id: id.clone(),
            persona: spec.persona,
            parent_id: None,
            state: AgentState::Active,
            is_sub_agent: false,
            session_id: session_id.clone(),
            owns_session,
            model: spec.model.unwrap_or_else(|| self.default_model.clone()),
            default_tools: spec.default_tools,
            roles: spec.roles.clone(),
            created_at: Utc::now(),
        };
        self.agents.lock().unwrap().insert(id.clone(), agent);
        self.bus.register(&id);
        self.bus.set_roles(&id, spec.roles);
        self.events.publish(
            id.clone(),
            session_id,
            EventPayload::AgentStateChanged {
                from: "created".into(),
                to: AgentState::Active.as_str().into(),
            },
        );
        debug!(agent = %id, "agent created");
        Ok(id)
    }

    /// Spawn a sub-agent of `parent_id` with the given context sharing.
    pub fn spawn_sub_agent(
        &self,
        parent_id: &str,
        spec: AgentSpec,
        sharing: ContextSharing,
    ) -> Result<String, RegistryError> {
        let parent = self
            .get(parent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(parent_id.to_string()))?;

        let id = Uuid::new_v4().to_string();
        let (session_id, owns_session) = match sharing {
            ContextSharing::Isolated => (self.store.create_session()?, true),
            ContextSharing::Shared => (parent.session_id.clone(), false),
            ContextSharing::Snapshot => {
                let cp = self.store.checkpoint(
                    &parent.session_id,
                    CheckpointKind::Auto,
                    Some(format!("snapshot for sub-agent {id}")),
                    None,
                )?;
                let new_session = Uuid::new_v4().to_string();
                self.store.branch(&parent.session_id, &cp, &new_session)?;
                (new_session, true)
            }
        };

        let agent = Agent {
            id: id.clone(),
            persona: spec.persona,
            parent_id: Some(parent_id.to_string()),
            state: AgentState::Active,
            is_sub_agent: true,
            session_id: session_id.clone(),
            owns_session,
            model: spec.model.unwrap_or(parent.model),
            default_tools: if spec.default_tools.is_empty() {
                parent.default_tools
            } else {
                spec.default_tools
            },
            roles: spec.roles.clone(),
            created_at: Utc::now(),
        };
        self.agents.lock().unwrap().insert(id.clone(), agent);
        self.bus.register(&id);
        self.bus.set_roles(&id, spec.roles);
        self.events.publish(
            id.clone(),
            session_id,
            EventPayload::AgentStateChanged {
                from: "created".into(),
                to: AgentState::Active.as_str().into(),
            },
        );
        debug!(agent = %id, parent = %parent_id, ?sharing, "sub-agent spawned");
        Ok(id)
    }

    pub fn get(&self, agent_id: &str) -> Option<Agent> {
        self.agents.lock().unwrap().get(agent_id).cloned()
    }

    pub fn list(&self, filter: &AgentFilter) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .lock()
            .unwrap()
            .values()
            .filter(|a| filter.state.map_or(true, |s| a.state == s))
            .filter(|a| {
                filter
                    .role
                    .as_ref()
                    .map_or(true, |r| a.roles.contains(r))
            })
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        agents
    }

    pub fn pause(&self, agent_id: &str) -> Result<(), RegistryError> {
        self.transition(agent_id, AgentState::Paused)?;
        self.bus.set_paused(agent_id, true);
        Ok(())
    }

    pub fn resume(&self, agent_id: &str) -> Result<(), RegistryError> {
        self.transition(agent_id, AgentState::Active)?;
        self.bus.set_paused(agent_id, false);
        Ok(())
    }

    /// Move an active agent into a terminal state (engine outcome).
    pub fn finish(&self, agent_id: &str, state: AgentState) -> Result<(), RegistryError> {
        debug_assert!(state.is_terminal());
        self.transition(agent_id, state)
    }

    fn transition(&self, agent_id: &str, to: AgentState) -> Result<(), RegistryError> {
        let mut agents = self.agents.lock().unwrap();
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;
        let from = agent.state;
        let valid = match to {
            AgentState::Paused => from == AgentState::Active,
            AgentState::Active => from == AgentState::Paused,
            AgentState::Cancelled | AgentState::Failed | AgentState::Completed => {
                from == AgentState::Active || from == AgentState::Paused
            }
        };
        if !valid {
            return Err(RegistryError::InvalidTransition {
                agent: agent_id.to_string(),
                from,
                to,
            });
        }
        agent.state = to;
        let session_id = agent.session_id.clone();
        drop(agents);
        self.events.publish(
            agent_id.to_string(),
            session_id,
            EventPayload::AgentStateChanged {
                from: from.as_str().into(),
                to: to.as_str().into(),
            },
        );
        Ok(())
    }

    /// Remove an agent.  Idempotent: destroying an unknown id is a no-op.
    ///
    /// `preserve_history` keeps the agent's session in the store; otherwise
    /// an owned session is removed (sessions branched from it are
    /// independent and stay).  `cascade` optionally extends the destroy to
    /// sub-agents.
    pub fn destroy(
        &self,
        agent_id: &str,
        preserve_history: bool,
        cascade: CascadePolicy,
    ) -> Result<(), RegistryError> {
        let removed = self.agents.lock().unwrap().remove(agent_id);
        let Some(agent) = removed else {
            return Ok(());
        };
        self.bus.unregister(agent_id);

        if !preserve_history && agent.owns_session {
            if let Err(e) = self.store.remove_session(&agent.session_id, true) {
                warn!(agent = %agent_id, error = %e, "failed to remove session");
            }
        }
        self.events.publish(
            agent_id.to_string(),
            agent.session_id.clone(),
            EventPayload::AgentStateChanged {
                from: agent.state.as_str().into(),
                to: "destroyed".into(),
            },
        );

        if cascade == CascadePolicy::Cascade {
            let children: Vec<String> = self
                .agents
                .lock()
                .unwrap()
                .values()
                .filter(|a| a.parent_id.as_deref() == Some(agent_id))
                .map(|a| a.id.clone())
                .collect();
            for child in children {
                self.destroy(&child, preserve_history, cascade)?;
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
