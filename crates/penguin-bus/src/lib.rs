// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod bus;
mod event;
mod msgbus;

pub use bus::{EventBus, RecvError, Subscription};
pub use event::{Event, EventFilter, EventPayload, EventTopic};
pub use msgbus::{Delivery, Envelope, MessageBus, Recipient, SendError};
