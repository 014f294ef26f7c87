// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use penguin_model::{Message, MessageType, Usage};
use serde::{Deserialize, Serialize};

/// Topic namespace emitted by the core and consumed by UIs/telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTopic {
    StreamChunk,
    StreamReasoning,
    StreamStart,
    StreamEnd,
    StreamCancelled,
    MessageAppended,
    ActionStarted,
    ActionCompleted,
    AgentStateChanged,
    EngineProgress,
    EngineError,
    CheckpointCreated,
    BusMessage,
}

impl EventTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StreamChunk => "stream.chunk",
            Self::StreamReasoning => "stream.reasoning",
            Self::StreamStart => "stream.start",
            Self::StreamEnd => "stream.end",
            Self::StreamCancelled => "stream.cancelled",
            Self::MessageAppended => "message.appended",
            Self::ActionStarted => "action.started",
            Self::ActionCompleted => "action.completed",
            Self::AgentStateChanged => "agent.state_changed",
            Self::EngineProgress => "engine.progress",
            Self::EngineError => "engine.error",
            Self::CheckpointCreated => "checkpoint.created",
            Self::BusMessage => "bus.message",
        }
    }
}

/// Event payload; the topic is derived from the variant so the two can
/// never disagree.
#[derive(Debug, Clone)]
pub enum EventPayload {
    StreamStart,
    /// Coalesced content deltas.  Reasoning text never appears here.
    StreamChunk { text: String },
    /// Coalesced reasoning deltas.  Content text never appears here.
    StreamReasoning { text: String },
    StreamEnd { usage: Usage },
    StreamCancelled,
    MessageAppended { message: Message },
    ActionStarted { action: String },
    ActionCompleted {
        action: String,
        status: String,
        duration_ms: u64,
    },
    AgentStateChanged { from: String, to: String },
    EngineProgress {
        iteration: u32,
        elapsed_ms: u64,
        tokens_in: u64,
        tokens_out: u64,
    },
    EngineError { kind: String, message: String },
    CheckpointCreated { checkpoint_id: String, kind: String },
    BusMessage {
        sender: String,
        channel: Option<String>,
        message_type: MessageType,
    },
}

impl EventPayload {
    pub fn topic(&self) -> EventTopic {
        match self {
            Self::StreamStart => EventTopic::StreamStart,
            Self::StreamChunk { .. } => EventTopic::StreamChunk,
            Self::StreamReasoning { .. } => EventTopic::StreamReasoning,
            Self::StreamEnd { .. } => EventTopic::StreamEnd,
            Self::StreamCancelled => EventTopic::StreamCancelled,
            Self::MessageAppended { .. } => EventTopic::MessageAppended,
            Self::ActionStarted { .. } => EventTopic::ActionStarted,
            Self::ActionCompleted { .. } => EventTopic::ActionCompleted,
            Self::AgentStateChanged { .. } => EventTopic::AgentStateChanged,
            Self::EngineProgress { .. } => EventTopic::EngineProgress,
            Self::EngineError { .. } => EventTopic::EngineError,
            Self::CheckpointCreated { .. } => EventTopic::CheckpointCreated,
            Self::BusMessage { .. } => EventTopic::BusMessage,
        }
    }
}

/// One published event.  `seq` is monotonic per bus.
#[derive(Debug, Clone)]
pub struct Event {
    pub seq: u64,
    pub agent_id: String,
    pub session_id: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn topic(&self) -> EventTopic {
        self.payload.topic()
    }

    /// Channel tag, for payloads that carry one.
    pub fn channel(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::MessageAppended { message } => message.channel.as_deref(),
            EventPayload::BusMessage { channel, .. } => channel.as_deref(),
            _ => None,
        }
    }

    /// Message type, for payloads that carry one.
    pub fn message_type(&self) -> Option<MessageType> {
        match &self.payload {
            EventPayload::MessageAppended { message } => Some(message.message_type),
            EventPayload::BusMessage { message_type, .. } => Some(*message_type),
            _ => None,
        }
    }
}

/// Restricts a subscription to a subset of the event flow.  Empty filter
/// matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    topics: Option<Vec<EventTopic>>,
    agent_id: Option<String>,
    channel: Option<String>,
    message_type: Option<MessageType>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn topic(mut self, topic: EventTopic) -> Self {
        self.topics.get_or_insert_with(Vec::new).push(topic);
        self
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(topics) = &self.topics {
            if !topics.contains(&event.topic()) {
                return false;
            }
        }
        if let Some(agent) = &self.agent_id {
            if event.agent_id != *agent {
                return false;
            }
        }
        if let Some(channel) = &self.channel {
            if event.channel() != Some(channel.as_str()) {
                return false;
            }
        }
        if let Some(mt) = &self.message_type {
            if event.message_type() != Some(*mt) {
                return false;
            }
        }
        true
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
