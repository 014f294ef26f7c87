// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::Arc;

use penguin_actions::{ActionExecutor, ActionHandler, ActionParser};
use penguin_agents::AgentRegistry;
use penguin_bus::{EventBus, EventPayload, MessageBus};
use penguin_config::Config;
use penguin_core::Engine;
use penguin_model::{MockGateway, ModelGateway};
use penguin_store::{CheckpointKind, ConversationStore};

use crate::checkpointer::Checkpointer;
use crate::coordinator::Coordinator;

/// Builds a [`Runtime`].  Handlers and action tags must be registered
/// before `build`, because registries are frozen behind `Arc`s afterwards.
pub struct RuntimeBuilder {
    config: Config,
    gateway: Option<Arc<dyn ModelGateway>>,
    executor: ActionExecutor,
    parser: ActionParser,
    store_root: Option<PathBuf>,
}

impl RuntimeBuilder {
    pub fn new(config: Config) -> Self {
        let executor = ActionExecutor::new(&config.engine);
        Self {
            config,
            gateway: None,
            executor,
            parser: ActionParser::new(),
            store_root: None,
        }
    }

    pub fn gateway(mut self, gateway: Arc<dyn ModelGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Register an action: the parser learns the tag and the executor the
    /// handler, under the same name.
    pub fn action(mut self, handler: impl ActionHandler + 'static) -> Self {
        self.parser.register(handler.name(), handler.param_hint());
        self.executor.register(handler);
        self
    }

    /// Persist conversation state under this directory; volatile otherwise.
    pub fn store_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.store_root = Some(root.into());
        self
    }

    pub fn build(self) -> anyhow::Result<Runtime> {
        let config = Arc::new(self.config);
        let store = Arc::new(match &self.store_root {
            Some(root) => ConversationStore::open(root)?,
            None => ConversationStore::in_memory(),
        });
        let events = Arc::new(EventBus::new(&config.bus));
        let bus = Arc::new(
            MessageBus::new(config.bus.queue_max).with_events(Arc::clone(&events)),
        );
        let registry = Arc::new(AgentRegistry::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&events),
            config.model.clone(),
        ));
        let gateway = self
            .gateway
            .unwrap_or_else(|| Arc::new(MockGateway) as Arc<dyn ModelGateway>);

        let engine = Arc::new(Engine::new(
            Arc::clone(&config),
            gateway,
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::new(self.executor),
            Arc::new(self.parser),
            Arc::clone(&events),
            Arc::clone(&bus),
        ));
        let coordinator = Coordinator::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            Arc::clone(&engine),
        );
        let checkpointer = Checkpointer::spawn(
            Arc::clone(&store),
            Arc::clone(&events),
            config.checkpoint.clone(),
        );

        Ok(Runtime {
            config,
            store,
            events,
            bus,
            registry,
            engine,
            coordinator,
            checkpointer,
        })
    }
}

/// The single per-process core instance.
///
/// Everything is scoped to this value — no process-global state — so tests
/// instantiate as many isolated runtimes as they like.
pub struct Runtime {
    config: Arc<Config>,
    store: Arc<ConversationStore>,
    events: Arc<EventBus>,
    bus: Arc<MessageBus>,
    registry: Arc<AgentRegistry>,
    engine: Arc<Engine>,
    coordinator: Coordinator,
    checkpointer: Checkpointer,
}

impl Runtime {
    pub fn builder(config: Config) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Take a manual checkpoint of a session's current head and announce it.
    pub fn checkpoint_now(
        &self,
        session_id: &str,
        name: Option<String>,
        description: Option<String>,
    ) -> anyhow::Result<String> {
        let id = self
            .store
            .checkpoint(session_id, CheckpointKind::Manual, name, description)?;
        self.events.publish(
            "",
            session_id,
            EventPayload::CheckpointCreated {
                checkpoint_id: id.clone(),
                kind: "manual".into(),
            },
        );
        Ok(id)
    }

    /// Stop background services.  Conversation state stays on disk.
    pub fn shutdown(&self) {
        self.checkpointer.shutdown();
    }
}
