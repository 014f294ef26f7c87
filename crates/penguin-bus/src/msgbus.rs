// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use penguin_model::MessageType;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::bus::EventBus;
use crate::event::EventPayload;

/// Who an envelope is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Agent(String),
    Role(String),
    Broadcast,
}

/// One inter-agent message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: String,
    pub recipient: Recipient,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    pub fn to_agent(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: Recipient::Agent(recipient.into()),
            channel: None,
            content: content.into(),
            message_type: MessageType::Message,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn to_role(
        sender: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: Recipient::Role(role.into()),
            channel: None,
            content: content.into(),
            message_type: MessageType::Message,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn broadcast(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            recipient: Recipient::Broadcast,
            channel: None,
            content: content.into(),
            message_type: MessageType::Message,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

/// A queued envelope plus delivery metadata.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    /// Bus-wide enqueue order.
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("recipient queue full: {recipient}")]
    QueueFull { recipient: String },
    #[error("no such recipient: {0}")]
    NoSuchRecipient(String),
    #[error("no agents with role: {0}")]
    NoSuchRole(String),
    #[error("broadcast has no eligible recipients")]
    NoRecipients,
}

struct RecipientQueue {
    deque: VecDeque<Delivery>,
    paused: bool,
    roles: HashSet<String>,
    notify: Arc<Notify>,
}

struct BusInner {
    queues: HashMap<String, RecipientQueue>,
    seq: u64,
}

/// Routes inter-agent messages.
///
/// Delivery is cooperative: `send` enqueues to bounded per-recipient queues
/// and engine loops pull with `poll`/`recv`.  Ordering is FIFO per
/// (sender, recipient, channel) — a consequence of the single FIFO queue
/// per recipient.  Sends are all-or-nothing across multi-recipient
/// resolution: nothing is enqueued unless every resolved recipient has
/// room.
pub struct MessageBus {
    inner: Mutex<BusInner>,
    queue_max: usize,
    events: Option<Arc<EventBus>>,
}

impl MessageBus {
    pub fn new(queue_max: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                queues: HashMap::new(),
                seq: 0,
            }),
            queue_max: queue_max.max(1),
            events: None,
        }
    }

    /// Mirror every accepted send as a `bus.message` event.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Make an agent addressable.  Idempotent.
    pub fn register(&self, agent_id: impl Into<String>) {
        let agent_id = agent_id.into();
        let mut inner = self.inner.lock().unwrap();
        inner.queues.entry(agent_id).or_insert_with(|| RecipientQueue {
            deque: VecDeque::new(),
            paused: false,
            roles: HashSet::new(),
            notify: Arc::new(Notify::new()),
        });
    }

    /// Remove an agent and discard its queue.  Idempotent.
    pub fn unregister(&self, agent_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(q) = inner.queues.remove(agent_id) {
            q.notify.notify_one();
        }
    }

    pub fn set_roles(&self, agent_id: &str, roles: impl IntoIterator<Item = String>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(q) = inner.queues.get_mut(agent_id) {
            q.roles = roles.into_iter().collect();
        }
    }

    pub fn set_paused(&self, agent_id: &str, paused: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(q) = inner.queues.get_mut(agent_id) {
            q.paused = paused;
            if !paused {
                q.notify.notify_one();
            }
        }
    }

    /// Route an envelope.  Returns the number of recipients it reached.
    ///
    /// Fails synchronously when the target does not resolve or any resolved
    /// queue is at capacity (nothing is delivered in that case, so the
    /// caller can retry the whole send).
    pub fn send(&self, envelope: Envelope) -> Result<usize, SendError> {
        let mut inner = self.inner.lock().unwrap();

        let mut targets: Vec<String> = match &envelope.recipient {
            Recipient::Agent(id) => {
                if !inner.queues.contains_key(id) {
                    return Err(SendError::NoSuchRecipient(id.clone()));
                }
                vec![id.clone()]
            }
            Recipient::Role(role) => {
                let mut ids: Vec<String> = inner
                    .queues
                    .iter()
                    .filter(|(_, q)| q.roles.contains(role))
                    .map(|(id, _)| id.clone())
                    .collect();
                if ids.is_empty() {
                    return Err(SendError::NoSuchRole(role.clone()));
                }
                ids.sort();
                ids
            }
            Recipient::Broadcast => {
                let mut ids: Vec<String> = inner
                    .queues
                    .keys()
                    .filter(|id| **id != envelope.sender)
                    .cloned()
                    .collect();
                if ids.is_empty() {
                    return Err(SendError::NoRecipients);
                }
                ids.sort();
                ids
            }
        };

        // Capacity check first so multi-recipient sends are atomic.
        for id in &targets {
            let q = &inner.queues[id];
            if q.deque.len() >= self.queue_max {
                return Err(SendError::QueueFull {
                    recipient: id.clone(),
                });
            }
        }

        inner.seq += 1;
        let seq = inner.seq;
        let enqueued_at = Utc::now();
        let delivered = targets.len();
        for id in targets.drain(..) {
            let q = inner.queues.get_mut(&id).expect("checked above");
            q.deque.push_back(Delivery {
                envelope: envelope.clone(),
                seq,
                enqueued_at,
            });
            if !q.paused {
                q.notify.notify_one();
            }
        }
        drop(inner);

        debug!(sender = %envelope.sender, delivered, "bus send");
        if let Some(events) = &self.events {
            events.publish(
                envelope.sender.clone(),
                "",
                EventPayload::BusMessage {
                    sender: envelope.sender.clone(),
                    channel: envelope.channel.clone(),
                    message_type: envelope.message_type,
                },
            );
        }
        Ok(delivered)
    }

    /// Non-blocking pull of the next queued delivery for `agent_id`.
    /// A paused recipient accumulates but does not deliver.
    pub fn poll(&self, agent_id: &str) -> Option<Delivery> {
        let mut inner = self.inner.lock().unwrap();
        let q = inner.queues.get_mut(agent_id)?;
        if q.paused {
            return None;
        }
        q.deque.pop_front()
    }

    /// Await the next delivery for `agent_id`.  Returns `None` once the
    /// agent is unregistered.
    pub async fn recv(&self, agent_id: &str) -> Option<Delivery> {
        loop {
            let notify = {
                let mut inner = self.inner.lock().unwrap();
                let q = inner.queues.get_mut(agent_id)?;
                if !q.paused {
                    if let Some(d) = q.deque.pop_front() {
                        return Some(d);
                    }
                }
                Arc::clone(&q.notify)
            };
            notify.notified().await;
        }
    }

    /// Number of envelopes waiting for `agent_id`.
    pub fn pending(&self, agent_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .queues
            .get(agent_id)
            .map(|q| q.deque.len())
            .unwrap_or(0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
