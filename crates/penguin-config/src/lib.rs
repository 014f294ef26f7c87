// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod loader;
mod schema;

pub use loader::load;
pub use schema::{
    BusConfig, CheckpointConfig, ConcurrentStreamPolicy, Config, ContextConfig, DropPolicy,
    EngineConfig, ModelConfig, RetryConfig, StreamConfig, TrimPolicy,
};
