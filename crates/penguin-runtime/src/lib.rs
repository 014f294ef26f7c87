// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod checkpointer;
mod coordinator;
mod runtime;

pub use checkpointer::Checkpointer;
pub use coordinator::{ChainOutcome, ChainStep, Coordinator, CoordinatorError};
pub use runtime::{Runtime, RuntimeBuilder};
