// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cancel;
mod gateway;
mod mock;
mod types;

pub use cancel::CancelToken;
pub use gateway::{DeltaKind, EventStream, GatewayRequest, ModelGateway, StreamEvent};
pub use mock::{MockGateway, ScriptedCall, ScriptedGateway};
pub use types::{ContentPart, Message, MessageContent, MessageType, Role, Usage};
