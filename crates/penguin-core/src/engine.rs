// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use penguin_actions::{ActionExecutor, ActionParser, ActionResult, ActionStatus, ExecutionContext};
use penguin_agents::{Agent, AgentRegistry};
use penguin_bus::{EventBus, EventPayload, MessageBus};
use penguin_config::{Config, ContextConfig};
use penguin_model::{
    CancelToken, GatewayRequest, Message, MessageType, ModelGateway, Usage,
};
use penguin_store::ConversationStore;
use tracing::{debug, error, warn};

use crate::prompts::{CONTINUATION_PROMPT, RECOVERY_PROMPT};
use crate::stop::{self, EngineState, StopCondition, StopReason};
use crate::stream::{StreamError, StreamMultiplexer, StreamOutcome};

/// Faults the loop cannot continue through.  Everything else is surfaced
/// to the model as an observation and the loop goes on.
#[derive(Debug, thiserror::Error)]
pub enum EngineFault {
    #[error("context overflow: {tokens} tokens exceed limit {limit}")]
    ContextOverflow { tokens: usize, limit: usize },
    #[error("a live stream already exists for {target}")]
    ConcurrentStream { target: String },
    #[error("no such agent: {0}")]
    UnknownAgent(String),
}

/// Typed failure carried by a terminal [`TaskStatus::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    EmptyResponse,
    ContextOverflow,
    Provider,
    Action,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyResponse => "failed_empty_response",
            Self::ContextOverflow => "failed_context_overflow",
            Self::Provider => "failed_provider",
            Self::Action => "failed_action",
            Self::Internal => "failed_internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Completed,
    Cancelled,
    Failed(FailureKind),
}

/// Result of one bounded task run.
#[derive(Debug)]
pub struct TaskResult {
    pub status: TaskStatus,
    /// Set when a stop condition (rather than a failure) ended the run.
    pub stop_reason: Option<StopReason>,
    /// Iterations actually executed; never exceeds the requested bound.
    pub iterations: u32,
    /// Final assistant content.
    pub content: String,
    pub usage: Usage,
    /// Count of failed action executions surfaced as observations.
    pub action_failures: u32,
    /// Human-readable terminal message.
    pub message: String,
}

/// Options for a single turn.
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    /// Per-turn context policy override.
    pub context: Option<ContextConfig>,
}

/// Result of one turn: final assistant content plus the results of every
/// action that content invoked.
#[derive(Debug, Default)]
pub struct TurnResult {
    pub content: String,
    /// Reasoning text, kept separate from content end to end.
    pub reasoning: String,
    pub actions: Vec<ActionResult>,
    pub usage: Usage,
    /// The turn was stopped by cancellation; no assistant message was
    /// appended for it.
    pub cancelled: bool,
}

/// The reason→act→observe loop.
///
/// One engine instance serves every agent in the runtime; per-run state
/// lives on the stack of `run_turn`/`run_task`, so concurrent runs for
/// different agents do not interfere.
pub struct Engine {
    config: Arc<Config>,
    gateway: Arc<dyn ModelGateway>,
    store: Arc<ConversationStore>,
    registry: Arc<AgentRegistry>,
    executor: Arc<ActionExecutor>,
    parser: Arc<ActionParser>,
    events: Arc<EventBus>,
    bus: Arc<MessageBus>,
    mux: StreamMultiplexer,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        gateway: Arc<dyn ModelGateway>,
        store: Arc<ConversationStore>,
        registry: Arc<AgentRegistry>,
        executor: Arc<ActionExecutor>,
        parser: Arc<ActionParser>,
        events: Arc<EventBus>,
        bus: Arc<MessageBus>,
    ) -> Self {
        let mux = StreamMultiplexer::new(Arc::clone(&events), config.stream.clone());
        Self {
            config,
            gateway,
            store,
            registry,
            executor,
            parser,
            events,
            bus,
            mux,
        }
    }

    fn agent(&self, agent_id: &str) -> Result<Agent, EngineFault> {
        self.registry
            .get(agent_id)
            .ok_or_else(|| EngineFault::UnknownAgent(agent_id.to_string()))
    }

    /// Drive one turn: append the prompt, stream a completion, execute any
    /// actions it invoked, and append an observation per result.
    pub async fn run_turn(
        &self,
        agent_id: &str,
        prompt: &str,
        opts: &TurnOptions,
    ) -> anyhow::Result<TurnResult> {
        self.run_turn_with_cancel(agent_id, prompt, opts, CancelToken::new())
            .await
    }

    /// Like [`run_turn`] with an external cancellation token.  Cancellation
    /// is honoured at the stream read boundary and between actions.
    pub async fn run_turn_with_cancel(
        &self,
        agent_id: &str,
        prompt: &str,
        opts: &TurnOptions,
        cancel: CancelToken,
    ) -> anyhow::Result<TurnResult> {
        let agent = self.agent(agent_id)?;
        let user = Message::user(prompt).with_agent(&agent.id);
        self.append_and_publish(&agent, user)?;
        self.turn_inner(&agent, opts, &cancel).await
    }

    /// Repeat single-turn semantics under stop conditions.
    ///
    /// Never returns an error: faults terminate the task with a typed
    /// failure status and an `engine.error` event instead.
    pub async fn run_task(
        &self,
        agent_id: &str,
        prompt: &str,
        stop_conditions: Vec<StopCondition>,
        max_iterations: Option<u32>,
        cancel: CancelToken,
    ) -> TaskResult {
        let session_id = self
            .registry
            .get(agent_id)
            .map(|a| a.session_id)
            .unwrap_or_default();
        match self
            .task_inner(agent_id, prompt, stop_conditions, max_iterations, &cancel)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                let kind = classify_fault(&e);
                error!(agent = %agent_id, error = %format!("{e:#}"), "task failed");
                self.events.publish(
                    agent_id,
                    session_id,
                    EventPayload::EngineError {
                        kind: kind.as_str().into(),
                        message: format!("{e:#}"),
                    },
                );
                TaskResult {
                    status: TaskStatus::Failed(kind),
                    stop_reason: None,
                    iterations: 0,
                    content: String::new(),
                    usage: Usage::default(),
                    action_failures: 0,
                    message: format!("{e:#}"),
                }
            }
        }
    }

    async fn task_inner(
        &self,
        agent_id: &str,
        prompt: &str,
        stop_conditions: Vec<StopCondition>,
        max_iterations: Option<u32>,
        cancel: &CancelToken,
    ) -> anyhow::Result<TaskResult> {
        let agent = self.agent(agent_id)?;
        let max_iters = max_iterations.unwrap_or(self.config.engine.max_iterations).max(1);

        let mut conditions = stop_conditions;
        if let Some(phrase) = &self.config.engine.completion_phrase {
            conditions.push(StopCondition::CompletionMarker(phrase.clone()));
        }

        let mut state = EngineState::new();
        let mut usage = Usage::default();
        let mut last_content = String::new();
        let mut action_failures = 0u32;
        let mut recovery_used = false;
        let mut next_prompt = prompt.to_string();

        loop {
            // Iteration boundary: the safe point for cancellation and
            // wall-clock stop conditions.
            state.cancelled = cancel.is_cancelled();
            if let Some(reason) = stop::evaluate(&conditions, &state, &last_content) {
                return Ok(self.finish_task(
                    &agent, reason, &state, usage, last_content, action_failures,
                ));
            }
            if state.iteration >= max_iters {
                return Ok(self.finish_task(
                    &agent,
                    StopReason::MaxIterations,
                    &state,
                    usage,
                    last_content,
                    action_failures,
                ));
            }
            state.iteration += 1;

            // Message-bus poll: cooperating agents' traffic becomes context
            // before the next model call.
            self.drain_inbox(&agent)?;

            let user = Message::user(&next_prompt).with_agent(&agent.id);
            self.append_and_publish(&agent, user)?;
            let turn = self.turn_inner(&agent, &TurnOptions::default(), cancel).await?;

            usage.add(turn.usage);
            state.tokens_in += turn.usage.input_tokens as u64;
            state.tokens_out += turn.usage.output_tokens as u64;
            state.pending_actions = 0;

            if turn.cancelled {
                state.cancelled = true;
                return Ok(self.finish_task(
                    &agent,
                    StopReason::Cancelled,
                    &state,
                    usage,
                    last_content,
                    action_failures,
                ));
            }

            let failed_now = turn
                .actions
                .iter()
                .filter(|r| r.status == ActionStatus::Failed)
                .count() as u32;
            action_failures += failed_now;
            if failed_now > 0 && self.config.engine.action_failure_fatal {
                let message = format!("{failed_now} action(s) failed and failures are fatal");
                self.events.publish(
                    agent.id.as_str(),
                    agent.session_id.as_str(),
                    EventPayload::EngineError {
                        kind: FailureKind::Action.as_str().into(),
                        message: message.clone(),
                    },
                );
                return Ok(TaskResult {
                    status: TaskStatus::Failed(FailureKind::Action),
                    stop_reason: None,
                    iterations: state.iteration,
                    content: last_content,
                    usage,
                    action_failures,
                    message,
                });
            }

            let empty = turn.content.trim().is_empty() && turn.actions.is_empty();
            if empty {
                if self.config.engine.empty_response_recovery && !recovery_used {
                    // One recovery iteration with a stricter continuation.
                    recovery_used = true;
                    warn!(agent = %agent.id, "empty response, forcing recovery iteration");
                    next_prompt = RECOVERY_PROMPT.to_string();
                } else {
                    let message = "assistant returned no content".to_string();
                    self.events.publish(
                        agent.id.as_str(),
                        agent.session_id.as_str(),
                        EventPayload::EngineError {
                            kind: FailureKind::EmptyResponse.as_str().into(),
                            message: message.clone(),
                        },
                    );
                    return Ok(TaskResult {
                        status: TaskStatus::Failed(FailureKind::EmptyResponse),
                        stop_reason: None,
                        iterations: state.iteration,
                        content: last_content,
                        usage,
                        action_failures,
                        message,
                    });
                }
            } else {
                if !turn.content.trim().is_empty() {
                    last_content = turn.content;
                }
                next_prompt = CONTINUATION_PROMPT.to_string();
            }

            self.events.publish(
                agent.id.as_str(),
                agent.session_id.as_str(),
                EventPayload::EngineProgress {
                    iteration: state.iteration,
                    elapsed_ms: state.elapsed().as_millis() as u64,
                    tokens_in: state.tokens_in,
                    tokens_out: state.tokens_out,
                },
            );
        }
    }

    fn finish_task(
        &self,
        agent: &Agent,
        reason: StopReason,
        state: &EngineState,
        usage: Usage,
        content: String,
        action_failures: u32,
    ) -> TaskResult {
        let status = if reason == StopReason::Cancelled {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Completed
        };
        debug!(agent = %agent.id, reason = reason.as_str(), iterations = state.iteration,
            "task finished");
        TaskResult {
            status,
            stop_reason: Some(reason),
            iterations: state.iteration,
            content,
            usage,
            action_failures,
            message: format!("stopped by {}", reason.as_str()),
        }
    }

    /// One reason→act→observe pass over an agent's session.  The caller has
    /// already appended whatever input this turn should react to.
    async fn turn_inner(
        &self,
        agent: &Agent,
        opts: &TurnOptions,
        cancel: &CancelToken,
    ) -> anyhow::Result<TurnResult> {
        let ctx_cfg = opts.context.clone().unwrap_or_else(|| self.config.context.clone());
        let window = self.store.context_window(&agent.session_id, &ctx_cfg)?;

        // Trimming is best effort; if the projection still exceeds the
        // model's window the task cannot proceed.
        let window_tokens: usize = window.iter().map(|m| m.approx_tokens()).sum();
        let mut limit = ctx_cfg.max_tokens;
        if let Some(model_limit) = self.gateway.context_window() {
            limit = limit.min(model_limit as usize);
        }
        if window_tokens > limit {
            return Err(EngineFault::ContextOverflow {
                tokens: window_tokens,
                limit,
            }
            .into());
        }

        let outcome = self.stream_with_retry(agent, window, cancel).await?;
        if outcome.cancelled {
            return Ok(TurnResult {
                usage: outcome.usage,
                cancelled: true,
                ..TurnResult::default()
            });
        }

        let content = outcome.content;
        let reasoning = outcome.reasoning;
        let mut results = Vec::new();

        if !content.trim().is_empty() {
            let parsed = self.parser.parse(&content);
            let mut assistant = Message::assistant(&content).with_agent(&agent.id);
            if !reasoning.is_empty() {
                assistant = assistant.with_meta("reasoning", reasoning.clone().into());
            }
            if !parsed.is_empty() {
                assistant = assistant.with_type(MessageType::Action);
            }
            self.append_and_publish(agent, assistant)?;

            let exec_ctx = ExecutionContext {
                agent_id: agent.id.clone(),
                session_id: agent.session_id.clone(),
                workdir: None,
            };
            for action in &parsed {
                // Action boundary: a latched cancel stops the batch here;
                // nothing runs after the signal has been observed.
                if cancel.is_cancelled() {
                    break;
                }
                if !agent.default_tools.is_empty()
                    && !agent.default_tools.contains(&action.name)
                {
                    let result = ActionResult {
                        action: action.name.clone(),
                        status: ActionStatus::Failed,
                        output: format!(
                            "action {} is not permitted for this agent",
                            action.name
                        ),
                        duration_ms: 0,
                        error_kind: Some("not_permitted".into()),
                        metadata: serde_json::Map::new(),
                    };
                    let observation = Message::observation(&result.action, &result.output)
                        .with_agent(&agent.id)
                        .with_meta("status", result.status.as_str().into())
                        .with_meta("error_kind", "not_permitted".into());
                    self.append_and_publish(agent, observation)?;
                    results.push(result);
                    continue;
                }
                self.events.publish(
                    agent.id.as_str(),
                    agent.session_id.as_str(),
                    EventPayload::ActionStarted {
                        action: action.name.clone(),
                    },
                );
                let result = self.executor.execute(action, &exec_ctx, cancel.clone()).await;
                self.events.publish(
                    agent.id.as_str(),
                    agent.session_id.as_str(),
                    EventPayload::ActionCompleted {
                        action: result.action.clone(),
                        status: result.status.as_str().into(),
                        duration_ms: result.duration_ms,
                    },
                );

                let mut observation = Message::observation(&result.action, &result.output)
                    .with_agent(&agent.id)
                    .with_meta("status", result.status.as_str().into())
                    .with_meta("duration_ms", result.duration_ms.into());
                if let Some(kind) = &result.error_kind {
                    observation = observation.with_meta("error_kind", kind.clone().into());
                }
                for (k, v) in &result.metadata {
                    observation = observation.with_meta(k.clone(), v.clone());
                }
                self.append_and_publish(agent, observation)?;
                results.push(result);
            }
        }

        Ok(TurnResult {
            content,
            reasoning,
            actions: results,
            usage: outcome.usage,
            cancelled: false,
        })
    }

    /// Call the gateway, replaying transient failures under bounded
    /// exponential backoff.  Permanent failures surface immediately.
    async fn stream_with_retry(
        &self,
        agent: &Agent,
        window: Vec<Message>,
        cancel: &CancelToken,
    ) -> anyhow::Result<StreamOutcome> {
        let req = GatewayRequest {
            messages: window,
            model: agent.model.clone(),
        };
        let retry = &self.config.engine.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match self.gateway.stream(req.clone(), cancel.child()).await {
                Ok(stream) => match self.mux.run(&agent.id, &agent.session_id, stream, cancel).await
                {
                    Ok(outcome) => return Ok(outcome),
                    Err(StreamError::ConcurrentStream { target }) => {
                        return Err(EngineFault::ConcurrentStream { target }.into());
                    }
                    Err(StreamError::Provider(e)) => e,
                },
                Err(e) => e,
            };

            if !is_transient_error(&err) {
                self.events.publish(
                    agent.id.as_str(),
                    agent.session_id.as_str(),
                    EventPayload::EngineError {
                        kind: "provider_permanent".into(),
                        message: format!("{err:#}"),
                    },
                );
                return Err(err.context("model stream failed (permanent)"));
            }
            if attempt >= retry.max_attempts.max(1) {
                return Err(err.context(format!("model stream failed after {attempt} attempts")));
            }

            let exp = (attempt - 1).min(16);
            let delay = Duration::from_millis(retry.base_delay_ms.saturating_mul(1u64 << exp));
            warn!(agent = %agent.id, attempt, delay_ms = delay.as_millis() as u64,
                "transient provider error, retrying: {err:#}");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Ok(StreamOutcome {
                        cancelled: true,
                        ..StreamOutcome::default()
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Pull queued inter-agent envelopes into the conversation.
    fn drain_inbox(&self, agent: &Agent) -> anyhow::Result<()> {
        while let Some(delivery) = self.bus.poll(&agent.id) {
            let envelope = delivery.envelope;
            let mut msg = Message::user(&envelope.content)
                .with_agent(&agent.id)
                .with_type(envelope.message_type)
                .with_meta("sender", envelope.sender.clone().into())
                .with_meta("bus_seq", delivery.seq.into());
            if let Some(channel) = &envelope.channel {
                msg = msg.with_channel(channel.clone());
            }
            self.append_and_publish(agent, msg)?;
        }
        Ok(())
    }

    fn append_and_publish(&self, agent: &Agent, message: Message) -> anyhow::Result<()> {
        let id = self
            .store
            .append(&agent.session_id, message.clone())
            .with_context(|| format!("appending to session {}", agent.session_id))?;
        let mut stamped = message;
        stamped.id = id;
        self.events.publish(
            agent.id.as_str(),
            agent.session_id.as_str(),
            EventPayload::MessageAppended { message: stamped },
        );
        Ok(())
    }
}

fn classify_fault(e: &anyhow::Error) -> FailureKind {
    match e.downcast_ref::<EngineFault>() {
        Some(EngineFault::ContextOverflow { .. }) => FailureKind::ContextOverflow,
        Some(EngineFault::ConcurrentStream { .. }) => FailureKind::Internal,
        Some(EngineFault::UnknownAgent(_)) => FailureKind::Internal,
        None => {
            if e.downcast_ref::<penguin_store::StoreError>().is_some() {
                FailureKind::Internal
            } else {
                FailureKind::Provider
            }
        }
    }
}

/// Classify a provider error as retryable.
///
/// Rate limits, gateway hiccups, and connection drops are transient; auth
/// and malformed-request failures are permanent.  Unknown shapes default
/// to transient — the attempt bound caps the damage.
fn is_transient_error(err: &anyhow::Error) -> bool {
    let msg = format!("{err:#}").to_ascii_lowercase();
    const PERMANENT: &[&str] = &[
        "400",
        "bad request",
        "401",
        "unauthorized",
        "403",
        "forbidden",
        "invalid api key",
        "not found",
        "request too large",
        "permanent",
    ];
    if PERMANENT.iter().any(|p| msg.contains(p)) {
        return false;
    }
    true
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
