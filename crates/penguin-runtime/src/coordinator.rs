// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use penguin_agents::{AgentFilter, AgentRegistry, AgentState};
use penguin_bus::{Envelope, MessageBus, SendError};
use penguin_core::{Engine, TurnOptions};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("no active agents with role: {0}")]
    NoSuchRole(String),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error("role {role} (agent {agent}) failed: {message}")]
    StepFailed {
        role: String,
        agent: String,
        message: String,
    },
    #[error("role {role} (agent {agent}) timed out after {timeout_ms} ms")]
    StepTimeout {
        role: String,
        agent: String,
        timeout_ms: u64,
    },
}

/// One completed link of a role chain.
#[derive(Debug, Clone)]
pub struct ChainStep {
    pub role: String,
    pub agent_id: String,
    pub content: String,
}

/// Result of a completed role chain.
#[derive(Debug)]
pub struct ChainOutcome {
    /// In-flight workflow id, for observability only.
    pub workflow_id: String,
    pub steps: Vec<ChainStep>,
    /// Output of the final role.
    pub output: String,
}

/// Higher-order patterns over registry + bus + engine.
///
/// The coordinator holds no state beyond round-robin rotation cursors and
/// the workflow id it stamps on a running chain.
pub struct Coordinator {
    registry: Arc<AgentRegistry>,
    bus: Arc<MessageBus>,
    engine: Arc<Engine>,
    rotation: Mutex<HashMap<String, usize>>,
}

impl Coordinator {
    pub fn new(registry: Arc<AgentRegistry>, bus: Arc<MessageBus>, engine: Arc<Engine>) -> Self {
        Self {
            registry,
            bus,
            engine,
            rotation: Mutex::new(HashMap::new()),
        }
    }

    fn active_agents_of(&self, role: &str) -> Result<Vec<String>, CoordinatorError> {
        let agents: Vec<String> = self
            .registry
            .list(&AgentFilter {
                state: Some(AgentState::Active),
                role: Some(role.to_string()),
            })
            .into_iter()
            .map(|a| a.id)
            .collect();
        if agents.is_empty() {
            return Err(CoordinatorError::NoSuchRole(role.to_string()));
        }
        Ok(agents)
    }

    /// Deliver one message to every agent tagged with `role`.
    pub fn send_to_role(
        &self,
        sender: &str,
        role: &str,
        content: &str,
    ) -> Result<usize, CoordinatorError> {
        Ok(self.bus.send(Envelope::to_role(sender, role, content))?)
    }

    /// Deliver one message to every agent carrying any of `roles`,
    /// de-duplicated across overlapping role sets.
    pub fn broadcast(
        &self,
        sender: &str,
        roles: &[&str],
        content: &str,
    ) -> Result<usize, CoordinatorError> {
        let mut targets: Vec<String> = Vec::new();
        for role in roles {
            for id in self.active_agents_of(role)? {
                if !targets.contains(&id) {
                    targets.push(id);
                }
            }
        }
        for id in &targets {
            self.bus.send(Envelope::to_agent(sender, id, content))?;
        }
        debug!(sender, delivered = targets.len(), "broadcast");
        Ok(targets.len())
    }

    /// Distribute `prompts` across the agents of `role`, one per agent in
    /// rotation.  Returns the (agent, prompt) assignments in input order.
    pub fn round_robin(
        &self,
        sender: &str,
        role: &str,
        prompts: Vec<String>,
    ) -> Result<Vec<(String, String)>, CoordinatorError> {
        let agents = self.active_agents_of(role)?;
        let mut rotation = self.rotation.lock().unwrap();
        let cursor = rotation.entry(role.to_string()).or_insert(0);

        let mut assignments = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let agent = agents[*cursor % agents.len()].clone();
            *cursor = (*cursor + 1) % agents.len();
            self.bus
                .send(Envelope::to_agent(sender, &agent, &prompt))?;
            assignments.push((agent, prompt));
        }
        Ok(assignments)
    }

    /// Sequence `prompt` through `roles`: each role's turn output becomes
    /// the next role's input.  Fails fast on the first failed or timed-out
    /// step.
    pub async fn role_chain(
        &self,
        roles: &[&str],
        prompt: &str,
        step_timeout: Duration,
    ) -> Result<ChainOutcome, CoordinatorError> {
        let workflow_id = Uuid::new_v4().to_string();
        let mut input = prompt.to_string();
        let mut steps = Vec::with_capacity(roles.len());

        for role in roles {
            // Rotation keeps repeated chains from always loading the same
            // agent of a multi-agent role.
            let agents = self.active_agents_of(role)?;
            let agent = {
                let mut rotation = self.rotation.lock().unwrap();
                let cursor = rotation.entry(format!("chain:{role}")).or_insert(0);
                let picked = agents[*cursor % agents.len()].clone();
                *cursor = (*cursor + 1) % agents.len();
                picked
            };

            debug!(workflow = %workflow_id, role, agent = %agent, "chain step");
            let turn = tokio::time::timeout(
                step_timeout,
                self.engine.run_turn(&agent, &input, &TurnOptions::default()),
            )
            .await;

            let turn = match turn {
                Err(_) => {
                    warn!(workflow = %workflow_id, role, "chain step timed out");
                    return Err(CoordinatorError::StepTimeout {
                        role: role.to_string(),
                        agent,
                        timeout_ms: step_timeout.as_millis() as u64,
                    });
                }
                Ok(Err(e)) => {
                    return Err(CoordinatorError::StepFailed {
                        role: role.to_string(),
                        agent,
                        message: format!("{e:#}"),
                    });
                }
                Ok(Ok(turn)) => turn,
            };

            input = turn.content.clone();
            steps.push(ChainStep {
                role: role.to_string(),
                agent_id: agent,
                content: turn.content,
            });
        }

        Ok(ChainOutcome {
            workflow_id,
            output: input,
            steps,
        })
    }
}
