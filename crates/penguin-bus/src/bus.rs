// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use penguin_config::{BusConfig, DropPolicy};
use tokio::sync::Notify;
use tracing::warn;

use crate::event::{Event, EventFilter, EventPayload};

/// Process-local topic pub/sub.
///
/// Each subscriber owns a bounded queue; a slow subscriber never blocks a
/// publisher.  Overflow behaviour is governed by [`DropPolicy`]: the default
/// evicts the oldest queued event (counted on the subscription), `fail`
/// poisons the lagging subscription instead.  No durability across restart.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    seq: AtomicU64,
    queue_max: usize,
    drop_policy: DropPolicy,
}

struct Subscriber {
    filter: EventFilter,
    queue: Arc<SubQueue>,
}

struct SubQueue {
    events: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
    overflowed: AtomicBool,
    closed: AtomicBool,
}

/// Receiving side of a subscription.  Dropping it unsubscribes.
pub struct Subscription {
    queue: Arc<SubQueue>,
}

/// Why a receive did not yield an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    /// The queue overflowed under `drop_policy = fail`; the subscription is
    /// closed and will yield no further events.
    #[error("subscriber queue overflowed after {dropped} undelivered events")]
    Overflowed { dropped: u64 },
    /// The bus or subscription was shut down.
    #[error("subscription closed")]
    Closed,
}

impl EventBus {
    pub fn new(cfg: &BusConfig) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            queue_max: cfg.queue_max.max(1),
            drop_policy: cfg.drop_policy,
        }
    }

    /// Subscribe with a filter.  Events published after this call that match
    /// the filter are delivered in publish order.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let queue = Arc::new(SubQueue {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            overflowed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.subscribers.lock().unwrap().push(Subscriber {
            filter,
            queue: Arc::clone(&queue),
        });
        Subscription { queue }
    }

    /// Publish an event; returns its bus-wide monotonic sequence number.
    /// Never blocks.
    pub fn publish(
        &self,
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
        payload: EventPayload,
    ) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let event = Event {
            seq,
            agent_id: agent_id.into(),
            session_id: session_id.into(),
            payload,
        };

        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|s| !s.queue.closed.load(Ordering::Acquire));
        for sub in subs.iter() {
            if sub.queue.overflowed.load(Ordering::Acquire) {
                continue;
            }
            if !sub.filter.matches(&event) {
                continue;
            }
            let mut q = sub.queue.events.lock().unwrap();
            if q.len() >= self.queue_max {
                match self.drop_policy {
                    DropPolicy::DropOldest => {
                        q.pop_front();
                        let dropped = sub.queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped == 1 || dropped % 100 == 0 {
                            warn!(dropped, topic = event.topic().as_str(),
                                "slow event subscriber, dropping oldest");
                        }
                    }
                    DropPolicy::Fail => {
                        sub.queue.dropped.fetch_add(1, Ordering::Relaxed);
                        sub.queue.overflowed.store(true, Ordering::Release);
                        drop(q);
                        sub.queue.notify.notify_one();
                        continue;
                    }
                }
            }
            q.push_back(event.clone());
            drop(q);
            sub.queue.notify.notify_one();
        }
        seq
    }

    /// Current sequence counter (the seq of the most recent publish).
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&BusConfig::default())
    }
}

impl Subscription {
    /// Await the next matching event.
    pub async fn recv(&self) -> Result<Event, RecvError> {
        loop {
            // Register interest before checking state so a publish between
            // the check and the await cannot be missed.
            let notified = self.queue.notify.notified();
            if let Some(ev) = self.queue.events.lock().unwrap().pop_front() {
                return Ok(ev);
            }
            if self.queue.overflowed.load(Ordering::Acquire) {
                self.queue.closed.store(true, Ordering::Release);
                return Err(RecvError::Overflowed {
                    dropped: self.queue.dropped.load(Ordering::Relaxed),
                });
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return Err(RecvError::Closed);
            }
            notified.await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<Event> {
        self.queue.events.lock().unwrap().pop_front()
    }

    /// Number of events evicted from this subscription's queue.
    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Stop receiving; pending events are discarded.
    pub fn close(&self) {
        self.queue.closed.store(true, Ordering::Release);
        self.queue.notify.notify_one();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use penguin_config::BusConfig;

    use super::*;
    use crate::event::EventTopic;

    fn bus_with(queue_max: usize, drop_policy: DropPolicy) -> EventBus {
        EventBus::new(&BusConfig {
            queue_max,
            drop_policy,
        })
    }

    fn chunk(text: &str) -> EventPayload {
        EventPayload::StreamChunk { text: text.into() }
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_in_order() {
        let bus = EventBus::default();
        let sub = bus.subscribe(EventFilter::all());
        bus.publish("a1", "s1", chunk("one"));
        bus.publish("a1", "s1", chunk("two"));

        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();
        assert!(matches!(first.payload, EventPayload::StreamChunk { ref text } if text == "one"));
        assert!(matches!(second.payload, EventPayload::StreamChunk { ref text } if text == "two"));
        assert!(second.seq > first.seq, "seq must be monotonic");
    }

    #[tokio::test]
    async fn filter_limits_delivery() {
        let bus = EventBus::default();
        let sub = bus.subscribe(EventFilter::all().topic(EventTopic::StreamEnd));
        bus.publish("a1", "s1", chunk("ignored"));
        bus.publish(
            "a1",
            "s1",
            EventPayload::StreamEnd {
                usage: Default::default(),
            },
        );
        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.topic(), EventTopic::StreamEnd);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn drop_oldest_evicts_and_counts() {
        let bus = bus_with(2, DropPolicy::DropOldest);
        let sub = bus.subscribe(EventFilter::all());
        for i in 0..5 {
            bus.publish("a1", "s1", chunk(&i.to_string()));
        }
        assert_eq!(sub.dropped_count(), 3);
        // Oldest survivors are the last two published.
        assert!(matches!(
            sub.try_recv().unwrap().payload,
            EventPayload::StreamChunk { ref text } if text == "3"
        ));
        assert!(matches!(
            sub.try_recv().unwrap().payload,
            EventPayload::StreamChunk { ref text } if text == "4"
        ));
    }

    #[tokio::test]
    async fn fail_policy_poisons_subscription() {
        let bus = bus_with(1, DropPolicy::Fail);
        let sub = bus.subscribe(EventFilter::all());
        bus.publish("a1", "s1", chunk("kept"));
        bus.publish("a1", "s1", chunk("overflow"));

        // The queued event is still delivered, then the overflow surfaces.
        assert!(sub.recv().await.is_ok());
        assert!(matches!(
            sub.recv().await,
            Err(RecvError::Overflowed { dropped: 1 })
        ));
    }

    #[tokio::test]
    async fn publisher_is_never_blocked_by_slow_subscriber() {
        let bus = bus_with(1, DropPolicy::DropOldest);
        let _sub = bus.subscribe(EventFilter::all());
        // 10k publishes with nobody draining must complete immediately.
        for _ in 0..10_000 {
            bus.publish("a1", "s1", chunk("x"));
        }
    }

    #[tokio::test]
    async fn closed_subscription_recv_errors() {
        let bus = EventBus::default();
        let sub = bus.subscribe(EventFilter::all());
        sub.close();
        assert!(matches!(sub.recv().await, Err(RecvError::Closed)));
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned_from_bus() {
        let bus = EventBus::default();
        let sub = bus.subscribe(EventFilter::all());
        drop(sub);
        bus.publish("a1", "s1", chunk("x"));
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let bus = Arc::new(EventBus::default());
        let sub = bus.subscribe(EventFilter::all());
        let publisher = Arc::clone(&bus);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            publisher.publish("a1", "s1", chunk("late"));
        });
        let ev = tokio::time::timeout(std::time::Duration::from_secs(1), sub.recv())
            .await
            .expect("recv must wake")
            .unwrap();
        assert!(matches!(ev.payload, EventPayload::StreamChunk { ref text } if text == "late"));
        handle.await.unwrap();
    }
}
