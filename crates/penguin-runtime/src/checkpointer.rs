// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use penguin_bus::{EventBus, EventFilter, EventPayload, EventTopic};
use penguin_config::CheckpointConfig;
use penguin_model::Role;
use penguin_store::{CheckpointKind, ConversationStore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Background checkpointing service.
///
/// Subscribes to `message.appended` and takes an auto checkpoint every
/// `auto_every` assistant messages per session; a periodic cleanup pass
/// applies the retention policy.  Both tasks are aborted on `shutdown` or
/// drop.
pub struct Checkpointer {
    tasks: Vec<JoinHandle<()>>,
}

impl Checkpointer {
    pub fn spawn(
        store: Arc<ConversationStore>,
        events: Arc<EventBus>,
        cfg: CheckpointConfig,
    ) -> Self {
        Self::spawn_with_cleanup_interval(store, events, cfg, Duration::from_secs(60))
    }

    /// Like [`spawn`] with a custom cleanup cadence (tests use a short one).
    pub fn spawn_with_cleanup_interval(
        store: Arc<ConversationStore>,
        events: Arc<EventBus>,
        cfg: CheckpointConfig,
        cleanup_every: Duration,
    ) -> Self {
        let mut tasks = Vec::new();

        if cfg.auto_every > 0 {
            let sub = events.subscribe(EventFilter::all().topic(EventTopic::MessageAppended));
            let store_auto = Arc::clone(&store);
            let events_auto = Arc::clone(&events);
            let auto_every = cfg.auto_every;
            tasks.push(tokio::spawn(async move {
                let mut counts: HashMap<String, u32> = HashMap::new();
                while let Ok(ev) = sub.recv().await {
                    let EventPayload::MessageAppended { message } = &ev.payload else {
                        continue;
                    };
                    if message.role != Role::Assistant {
                        continue;
                    }
                    let count = counts.entry(ev.session_id.clone()).or_default();
                    *count += 1;
                    if *count < auto_every {
                        continue;
                    }
                    *count = 0;
                    match store_auto.checkpoint(&ev.session_id, CheckpointKind::Auto, None, None)
                    {
                        Ok(id) => {
                            debug!(session = %ev.session_id, checkpoint = %id,
                                "auto checkpoint");
                            events_auto.publish(
                                ev.agent_id.clone(),
                                ev.session_id.clone(),
                                EventPayload::CheckpointCreated {
                                    checkpoint_id: id,
                                    kind: "auto".into(),
                                },
                            );
                        }
                        Err(e) => {
                            warn!(session = %ev.session_id, error = %e,
                                "auto checkpoint failed");
                        }
                    }
                }
            }));
        }

        let store_cleanup = store;
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so a fresh
            // runtime does not prune before anything happened.
            interval.tick().await;
            loop {
                interval.tick().await;
                let now = Utc::now();
                for session_id in store_cleanup.session_ids() {
                    if let Err(e) = store_cleanup.prune_checkpoints(&session_id, &cfg, now) {
                        warn!(session = %session_id, error = %e, "checkpoint cleanup failed");
                    }
                }
            }
        }));

        Self { tasks }
    }

    /// Stop both background tasks.
    pub fn shutdown(&self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
