// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests for the engine loop.
///
/// Uses `ScriptedGateway` so every scenario is deterministic and requires
/// no network access.
#[cfg(test)]
mod engine_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream;
    use futures::StreamExt as _;
    use penguin_actions::{
        ActionExecutor, ActionHandler, ActionParser, ExecutionContext, HandlerOutcome,
    };
    use penguin_agents::{AgentRegistry, AgentSpec};
    use penguin_bus::{EventBus, EventFilter, EventPayload, EventTopic, MessageBus, Envelope};
    use penguin_config::Config;
    use penguin_model::{
        CancelToken, DeltaKind, EventStream, GatewayRequest, ModelGateway, Role, ScriptedCall,
        ScriptedGateway, StreamEvent,
    };
    use penguin_store::ConversationStore;

    use crate::{Engine, FailureKind, StopCondition, TaskStatus, TurnOptions};

    // ── Helpers ───────────────────────────────────────────────────────────────

    struct EchoHandler;

    #[async_trait]
    impl ActionHandler for EchoHandler {
        fn name(&self) -> &str {
            "run"
        }
        async fn execute(
            &self,
            params: &str,
            _ctx: &ExecutionContext,
            _cancel: CancelToken,
        ) -> anyhow::Result<HandlerOutcome> {
            Ok(HandlerOutcome::text(format!("ran: {params}")))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl ActionHandler for FailingHandler {
        fn name(&self) -> &str {
            "broken"
        }
        async fn execute(
            &self,
            _params: &str,
            _ctx: &ExecutionContext,
            _cancel: CancelToken,
        ) -> anyhow::Result<HandlerOutcome> {
            anyhow::bail!("handler exploded")
        }
    }

    struct Fixture {
        engine: Engine,
        events: Arc<EventBus>,
        store: Arc<ConversationStore>,
        registry: Arc<AgentRegistry>,
        bus: Arc<MessageBus>,
        agent: String,
        session: String,
    }

    fn fixture_with(gateway: Arc<dyn ModelGateway>, config: Config) -> Fixture {
        let config = Arc::new(config);
        let store = Arc::new(ConversationStore::in_memory());
        let events = Arc::new(EventBus::new(&config.bus));
        let bus = Arc::new(MessageBus::new(config.bus.queue_max));
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&events),
            config.model.clone(),
        ));

        let mut executor = ActionExecutor::new(&config.engine);
        executor.register(EchoHandler);
        executor.register(FailingHandler);

        let mut parser = ActionParser::new();
        parser.register("run", "shell command line");
        parser.register("broken", "anything");

        let engine = Engine::new(
            Arc::clone(&config),
            gateway,
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::new(executor),
            Arc::new(parser),
            Arc::clone(&events),
            Arc::clone(&bus),
        );

        let agent = registry.create(AgentSpec::default()).unwrap();
        let session = registry.get(&agent).unwrap().session_id;
        Fixture {
            engine,
            events,
            store,
            registry,
            bus,
            agent,
            session,
        }
    }

    fn fixture(gateway: ScriptedGateway) -> Fixture {
        fixture_with(Arc::new(gateway), Config::default())
    }

    /// Gateway that emits one delta and then hangs until cancelled.
    struct HangingGateway;

    #[async_trait]
    impl ModelGateway for HangingGateway {
        fn name(&self) -> &str {
            "hanging"
        }
        async fn stream(
            &self,
            _req: GatewayRequest,
            _cancel: CancelToken,
        ) -> anyhow::Result<EventStream> {
            let head = stream::iter(vec![Ok(StreamEvent::Delta {
                text: "partial ".into(),
                kind: DeltaKind::Content,
            })]);
            Ok(Box::pin(head.chain(stream::pending())))
        }
    }

    // ── Scenario: single turn, no actions ─────────────────────────────────────

    #[tokio::test]
    async fn single_turn_streams_and_appends() {
        let fx = fixture(ScriptedGateway::always_deltas(vec!["hi ", "there"]));
        let sub = fx.events.subscribe(EventFilter::all());

        let result = fx
            .engine
            .run_turn(&fx.agent, "hello", &TurnOptions::default())
            .await
            .unwrap();

        assert_eq!(result.content, "hi there");
        assert!(result.actions.is_empty());

        let mut topics = Vec::new();
        while let Some(ev) = sub.try_recv() {
            topics.push(ev.topic());
        }
        let expect_order = [
            EventTopic::MessageAppended, // user
            EventTopic::StreamStart,
            EventTopic::StreamChunk,
            EventTopic::StreamEnd,
            EventTopic::MessageAppended, // assistant
        ];
        let mut it = topics.iter();
        for expected in expect_order {
            assert!(
                it.any(|t| *t == expected),
                "missing {expected:?} in order within {topics:?}"
            );
        }

        let msgs = fx.store.messages(&fx.session).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[1].as_text(), Some("hi there"));
    }

    #[tokio::test]
    async fn reasoning_lands_in_metadata_not_content() {
        let fx = fixture(ScriptedGateway::new(vec![
            ScriptedGateway::reasoning_then_text("let me think", "the answer"),
        ]));
        let result = fx
            .engine
            .run_turn(&fx.agent, "q", &TurnOptions::default())
            .await
            .unwrap();
        assert_eq!(result.content, "the answer");
        assert_eq!(result.reasoning, "let me think");

        let msgs = fx.store.messages(&fx.session).unwrap();
        let assistant = msgs.iter().find(|m| m.role == Role::Assistant).unwrap();
        assert_eq!(assistant.as_text(), Some("the answer"));
        assert_eq!(
            assistant.metadata.get("reasoning").and_then(|v| v.as_str()),
            Some("let me think")
        );
    }

    // ── Scenario: action parse + execute ──────────────────────────────────────

    #[tokio::test]
    async fn action_is_parsed_executed_and_observed() {
        let fx = fixture(ScriptedGateway::new(vec![ScriptedGateway::text_call(
            "checking <run>ls</run> now",
        )]));
        let sub = fx.events.subscribe(EventFilter::all().topic(EventTopic::ActionCompleted));

        let result = fx
            .engine
            .run_turn(&fx.agent, "list files", &TurnOptions::default())
            .await
            .unwrap();

        assert_eq!(result.actions.len(), 1);
        assert_eq!(result.actions[0].output, "ran: ls");

        let msgs = fx.store.messages(&fx.session).unwrap();
        let observation = msgs.iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(observation.as_text(), Some("ran: ls"));
        assert_eq!(
            observation.metadata.get("status").and_then(|v| v.as_str()),
            Some("completed")
        );
        assert!(sub.try_recv().is_some(), "action.completed must be emitted");
    }

    #[tokio::test]
    async fn next_iteration_sees_observation_in_context() {
        let gateway = ScriptedGateway::new(vec![
            ScriptedGateway::text_call("<run>whoami</run>"),
            ScriptedGateway::text_call("done DONE_OK"),
        ]);
        let last_request = Arc::clone(&gateway.last_request);

        let mut config = Config::default();
        config.engine.completion_phrase = Some("DONE_OK".into());
        let fx = fixture_with(Arc::new(gateway), config);

        let result = fx
            .engine
            .run_task(&fx.agent, "go", vec![], Some(5), CancelToken::new())
            .await;
        assert_eq!(result.status, TaskStatus::Completed);

        let seen = last_request.lock().unwrap().take().unwrap();
        let has_observation = seen
            .messages
            .iter()
            .any(|m| m.role == Role::Tool && m.as_text() == Some("ran: whoami"));
        assert!(
            has_observation,
            "second model call must see the first call's observation"
        );
    }

    #[tokio::test]
    async fn action_failure_is_observation_not_task_failure() {
        let gateway = ScriptedGateway::new(vec![
            ScriptedGateway::text_call("<broken>x</broken>"),
            ScriptedGateway::text_call("recovered DONE_OK"),
        ]);
        let mut config = Config::default();
        config.engine.completion_phrase = Some("DONE_OK".into());
        let fx = fixture_with(Arc::new(gateway), config);

        let result = fx
            .engine
            .run_task(&fx.agent, "go", vec![], Some(5), CancelToken::new())
            .await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.action_failures, 1);

        let msgs = fx.store.messages(&fx.session).unwrap();
        let failed_obs = msgs.iter().find(|m| {
            m.role == Role::Tool
                && m.metadata.get("status").and_then(|v| v.as_str()) == Some("failed")
        });
        assert!(failed_obs.is_some(), "failed action must appear as observation");
    }

    #[tokio::test]
    async fn unpermitted_action_is_refused_without_executing() {
        let fx = fixture(ScriptedGateway::new(vec![ScriptedGateway::text_call(
            "<run>rm -rf /</run>",
        )]));
        // Restrict the agent to a tool set that excludes `run`.
        let restricted = fx
            .registry
            .create(penguin_agents::AgentSpec {
                default_tools: vec!["write".into()],
                ..penguin_agents::AgentSpec::default()
            })
            .unwrap();

        let result = fx
            .engine
            .run_turn(&restricted, "try it", &TurnOptions::default())
            .await
            .unwrap();
        assert_eq!(result.actions.len(), 1);
        assert_eq!(result.actions[0].error_kind.as_deref(), Some("not_permitted"));
        assert!(result.actions[0].output.contains("not permitted"));
    }

    #[tokio::test]
    async fn fatal_action_policy_terminates_task() {
        let gateway = ScriptedGateway::new(vec![ScriptedGateway::text_call("<broken>x</broken>")]);
        let mut config = Config::default();
        config.engine.action_failure_fatal = true;
        let fx = fixture_with(Arc::new(gateway), config);

        let result = fx
            .engine
            .run_task(&fx.agent, "go", vec![], Some(5), CancelToken::new())
            .await;
        assert_eq!(result.status, TaskStatus::Failed(FailureKind::Action));
    }

    // ── Scenario: bounded task with completion marker ─────────────────────────

    #[tokio::test]
    async fn completion_marker_ends_task_on_iteration_two() {
        let gateway = ScriptedGateway::new(vec![
            ScriptedGateway::text_call("still working"),
            ScriptedGateway::text_call("all finished. DONE_OK"),
        ]);
        let mut config = Config::default();
        config.engine.completion_phrase = Some("DONE_OK".into());
        let fx = fixture_with(Arc::new(gateway), config);

        let result = fx
            .engine
            .run_task(&fx.agent, "work", vec![], Some(5), CancelToken::new())
            .await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.iterations, 2);
        assert_eq!(
            result.stop_reason,
            Some(crate::StopReason::CompletionMarker)
        );
        assert!(result.content.contains("DONE_OK"));
    }

    #[tokio::test]
    async fn iteration_count_never_exceeds_bound() {
        // Model never terminates on its own.
        let scripts: Vec<ScriptedCall> = (0..10)
            .map(|i| ScriptedGateway::text_call(format!("thinking about step {i}")))
            .collect();
        let fx = fixture(ScriptedGateway::new(scripts));

        let result = fx
            .engine
            .run_task(&fx.agent, "loop", vec![], Some(3), CancelToken::new())
            .await;
        assert_eq!(result.iterations, 3);
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.stop_reason, Some(crate::StopReason::MaxIterations));
    }

    #[tokio::test]
    async fn progress_events_are_emitted_per_iteration() {
        let gateway = ScriptedGateway::new(vec![
            ScriptedGateway::text_call("one"),
            ScriptedGateway::text_call("two"),
        ]);
        let fx = fixture(gateway);
        let sub = fx
            .events
            .subscribe(EventFilter::all().topic(EventTopic::EngineProgress));

        fx.engine
            .run_task(&fx.agent, "go", vec![], Some(2), CancelToken::new())
            .await;

        let mut iterations = Vec::new();
        while let Some(ev) = sub.try_recv() {
            if let EventPayload::EngineProgress { iteration, .. } = ev.payload {
                iterations.push(iteration);
            }
        }
        assert_eq!(iterations, vec![1, 2]);
    }

    // ── Empty-response recovery ───────────────────────────────────────────────

    #[tokio::test]
    async fn one_empty_response_triggers_recovery() {
        let gateway = ScriptedGateway::new(vec![
            ScriptedGateway::empty_call(),
            ScriptedGateway::text_call("back on track DONE_OK"),
        ]);
        let mut config = Config::default();
        config.engine.completion_phrase = Some("DONE_OK".into());
        let fx = fixture_with(Arc::new(gateway), config);

        let result = fx
            .engine
            .run_task(&fx.agent, "go", vec![], Some(5), CancelToken::new())
            .await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.iterations, 2, "recovery costs exactly one iteration");

        // The recovery continuation must be in the session history.
        let msgs = fx.store.messages(&fx.session).unwrap();
        assert!(msgs
            .iter()
            .any(|m| m.as_text().is_some_and(|t| t.contains("previous reply was empty"))));
    }

    #[tokio::test]
    async fn repeated_empty_responses_fail_the_task() {
        let gateway = ScriptedGateway::new(vec![
            ScriptedGateway::empty_call(),
            ScriptedGateway::empty_call(),
        ]);
        let fx = fixture(gateway);

        let result = fx
            .engine
            .run_task(&fx.agent, "go", vec![], Some(5), CancelToken::new())
            .await;
        assert_eq!(result.status, TaskStatus::Failed(FailureKind::EmptyResponse));
        assert_eq!(result.iterations, 2);
    }

    #[tokio::test]
    async fn recovery_disabled_fails_on_first_empty() {
        let gateway = ScriptedGateway::new(vec![ScriptedGateway::empty_call()]);
        let mut config = Config::default();
        config.engine.empty_response_recovery = false;
        let fx = fixture_with(Arc::new(gateway), config);

        let result = fx
            .engine
            .run_task(&fx.agent, "go", vec![], Some(5), CancelToken::new())
            .await;
        assert_eq!(result.status, TaskStatus::Failed(FailureKind::EmptyResponse));
        assert_eq!(result.iterations, 1);
    }

    // ── Retry and provider failures ───────────────────────────────────────────

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let gateway = ScriptedGateway::new(vec![
            ScriptedCall::Fail("503 overloaded".into()),
            ScriptedGateway::text_call("second try worked"),
        ]);
        let calls = Arc::clone(&gateway.calls);
        let mut config = Config::default();
        config.engine.retry.base_delay_ms = 1;
        let fx = fixture_with(Arc::new(gateway), config);

        let result = fx
            .engine
            .run_turn(&fx.agent, "q", &TurnOptions::default())
            .await
            .unwrap();
        assert_eq!(result.content, "second try worked");
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let gateway = ScriptedGateway::new(vec![
            ScriptedCall::Fail("401 unauthorized".into()),
            ScriptedGateway::text_call("never reached"),
        ]);
        let calls = Arc::clone(&gateway.calls);
        let fx = fixture_with(Arc::new(gateway), Config::default());
        let sub = fx
            .events
            .subscribe(EventFilter::all().topic(EventTopic::EngineError));

        let err = fx
            .engine
            .run_turn(&fx.agent, "q", &TurnOptions::default())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("401"));
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(sub.try_recv().is_some(), "engine.error must be published");
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_task_as_provider() {
        let gateway = ScriptedGateway::new(vec![
            ScriptedCall::Fail("503 overloaded".into()),
            ScriptedCall::Fail("503 overloaded".into()),
            ScriptedCall::Fail("503 overloaded".into()),
        ]);
        let mut config = Config::default();
        config.engine.retry.max_attempts = 3;
        config.engine.retry.base_delay_ms = 1;
        let fx = fixture_with(Arc::new(gateway), config);

        let result = fx
            .engine
            .run_task(&fx.agent, "q", vec![], Some(3), CancelToken::new())
            .await;
        assert_eq!(result.status, TaskStatus::Failed(FailureKind::Provider));
    }

    // ── Scenario: cancellation mid-stream ─────────────────────────────────────

    #[tokio::test]
    async fn cancellation_mid_stream_cancels_task_cleanly() {
        let fx = fixture_with(Arc::new(HangingGateway), Config::default());
        let sub = fx.events.subscribe(EventFilter::all());
        let cancel = CancelToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = fx
            .engine
            .run_task(&fx.agent, "go", vec![], Some(5), cancel)
            .await;
        assert_eq!(result.status, TaskStatus::Cancelled);

        // stream.cancelled must appear; no assistant message was appended.
        let mut saw_cancelled = false;
        while let Some(ev) = sub.try_recv() {
            if ev.topic() == EventTopic::StreamCancelled {
                saw_cancelled = true;
            }
        }
        assert!(saw_cancelled);
        let msgs = fx.store.messages(&fx.session).unwrap();
        assert!(
            msgs.iter().all(|m| m.role != Role::Assistant),
            "cancelled turn must not append an assistant message"
        );
        assert!(
            msgs.iter().all(|m| m.role != Role::Tool),
            "no action may run after cancellation"
        );
    }

    #[tokio::test]
    async fn pre_cancelled_task_runs_zero_iterations() {
        let fx = fixture(ScriptedGateway::always_text("never"));
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = fx
            .engine
            .run_task(&fx.agent, "go", vec![], Some(5), cancel)
            .await;
        assert_eq!(result.status, TaskStatus::Cancelled);
        assert_eq!(result.iterations, 0);
    }

    // ── Stop conditions ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn token_budget_stops_the_loop() {
        // Each scripted call reports 5 in + 5 out tokens.
        let scripts: Vec<ScriptedCall> = (0..5)
            .map(|_| {
                ScriptedCall::Events(vec![
                    StreamEvent::Delta {
                        text: "step".into(),
                        kind: DeltaKind::Content,
                    },
                    StreamEvent::Usage(penguin_model::Usage {
                        input_tokens: 5,
                        output_tokens: 5,
                    }),
                    StreamEvent::Done,
                ])
            })
            .collect();
        let fx = fixture(ScriptedGateway::new(scripts));

        let result = fx
            .engine
            .run_task(
                &fx.agent,
                "go",
                vec![StopCondition::TokenBudget(15)],
                Some(10),
                CancelToken::new(),
            )
            .await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.stop_reason, Some(crate::StopReason::TokenBudget));
        assert_eq!(result.iterations, 2, "10 tokens after it. 1, 20 after it. 2");
    }

    #[tokio::test]
    async fn external_condition_consults_engine_state() {
        let scripts: Vec<ScriptedCall> =
            (0..5).map(|_| ScriptedGateway::text_call("step")).collect();
        let fx = fixture(ScriptedGateway::new(scripts));

        let result = fx
            .engine
            .run_task(
                &fx.agent,
                "go",
                vec![StopCondition::External(Arc::new(|s| s.iteration >= 2))],
                Some(10),
                CancelToken::new(),
            )
            .await;
        assert_eq!(result.iterations, 2);
        assert_eq!(result.stop_reason, Some(crate::StopReason::External));
    }

    // ── Inter-agent inbox ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn queued_envelopes_become_context_before_the_model_call() {
        let gateway = ScriptedGateway::always_text("noted DONE_OK");
        let last_request = Arc::clone(&gateway.last_request);
        let mut config = Config::default();
        config.engine.completion_phrase = Some("DONE_OK".into());
        let fx = fixture_with(Arc::new(gateway), config);

        fx.bus
            .send(Envelope::to_agent("coordinator", &fx.agent, "priority update"))
            .unwrap();

        let result = fx
            .engine
            .run_task(&fx.agent, "go", vec![], Some(3), CancelToken::new())
            .await;
        assert_eq!(result.status, TaskStatus::Completed);

        let seen = last_request.lock().unwrap().take().unwrap();
        assert!(
            seen.messages
                .iter()
                .any(|m| m.as_text() == Some("priority update")),
            "bus traffic must be drained into the context"
        );
        let msgs = fx.store.messages(&fx.session).unwrap();
        let delivered = msgs
            .iter()
            .find(|m| m.as_text() == Some("priority update"))
            .unwrap();
        assert_eq!(
            delivered.metadata.get("sender").and_then(|v| v.as_str()),
            Some("coordinator")
        );
    }

    // ── Context overflow ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn oversized_context_fails_with_overflow() {
        let gateway = ScriptedGateway::always_text("unreachable");
        let mut config = Config::default();
        config.context.max_tokens = 2;
        config.context.keep_recent = 1;
        let fx = fixture_with(Arc::new(gateway), config);

        // A single message far over the budget cannot be trimmed away.
        let big = "word ".repeat(500);
        let result = fx
            .engine
            .run_task(&fx.agent, &big, vec![], Some(3), CancelToken::new())
            .await;
        assert_eq!(
            result.status,
            TaskStatus::Failed(FailureKind::ContextOverflow)
        );
    }

    // ── Engine reuse across agents ────────────────────────────────────────────

    #[tokio::test]
    async fn two_agents_keep_separate_sessions() {
        let gateway = ScriptedGateway::new(vec![
            ScriptedGateway::text_call("for alpha"),
            ScriptedGateway::text_call("for beta"),
        ]);
        let fx = fixture_with(Arc::new(gateway), Config::default());
        let beta = fx.registry.create(AgentSpec::default()).unwrap();
        let beta_session = fx.registry.get(&beta).unwrap().session_id;

        fx.engine
            .run_turn(&fx.agent, "one", &TurnOptions::default())
            .await
            .unwrap();
        fx.engine
            .run_turn(&beta, "two", &TurnOptions::default())
            .await
            .unwrap();

        let alpha_msgs = fx.store.messages(&fx.session).unwrap();
        let beta_msgs = fx.store.messages(&beta_session).unwrap();
        assert!(alpha_msgs.iter().any(|m| m.as_text() == Some("for alpha")));
        assert!(beta_msgs.iter().any(|m| m.as_text() == Some("for beta")));
        assert!(alpha_msgs.iter().all(|m| m.as_text() != Some("for beta")));
    }
}
