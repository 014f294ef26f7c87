// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Mutable view of one engine run, evaluated by stop conditions between
/// iterations.
#[derive(Debug, Clone)]
pub struct EngineState {
    /// 1-based index of the iteration that just finished.
    pub iteration: u32,
    pub started: Instant,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cancelled: bool,
    pub pending_actions: usize,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            iteration: 0,
            started: Instant::now(),
            tokens_in: 0,
            tokens_out: 0,
            cancelled: false,
            pending_actions: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

/// Predicate that may terminate a bounded task early.
#[derive(Clone)]
pub enum StopCondition {
    /// Total tokens (in + out) consumed by the run.
    TokenBudget(u64),
    /// Wall-clock bound, enforced at iteration boundaries only.
    WallClock(Duration),
    /// Extra iteration cap on top of the run's `max_iterations`.
    MaxIterations(u32),
    /// Terminate successfully when this marker appears in assistant output.
    CompletionMarker(String),
    /// Host-provided callback over the engine state.
    External(Arc<dyn Fn(&EngineState) -> bool + Send + Sync>),
}

impl fmt::Debug for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenBudget(n) => write!(f, "TokenBudget({n})"),
            Self::WallClock(d) => write!(f, "WallClock({d:?})"),
            Self::MaxIterations(n) => write!(f, "MaxIterations({n})"),
            Self::CompletionMarker(m) => write!(f, "CompletionMarker({m:?})"),
            Self::External(_) => write!(f, "External(..)"),
        }
    }
}

/// Why a bounded task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    CompletionMarker,
    TokenBudget,
    WallClock,
    MaxIterations,
    External,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::CompletionMarker => "completion_marker",
            Self::TokenBudget => "token_budget",
            Self::WallClock => "wall_clock",
            Self::MaxIterations => "max_iterations",
            Self::External => "external",
        }
    }
}

/// Evaluate conditions in a fixed order (first hit wins): cancellation,
/// completion marker, token budget, wall clock, external callbacks, then
/// iteration caps.
pub fn evaluate(
    conditions: &[StopCondition],
    state: &EngineState,
    last_assistant_text: &str,
) -> Option<StopReason> {
    if state.cancelled {
        return Some(StopReason::Cancelled);
    }
    for c in conditions {
        if let StopCondition::CompletionMarker(marker) = c {
            if !marker.is_empty() && last_assistant_text.contains(marker) {
                return Some(StopReason::CompletionMarker);
            }
        }
    }
    for c in conditions {
        if let StopCondition::TokenBudget(budget) = c {
            if state.tokens_in + state.tokens_out >= *budget {
                return Some(StopReason::TokenBudget);
            }
        }
    }
    for c in conditions {
        if let StopCondition::WallClock(limit) = c {
            if state.elapsed() >= *limit {
                return Some(StopReason::WallClock);
            }
        }
    }
    for c in conditions {
        if let StopCondition::External(f) = c {
            if f(state) {
                return Some(StopReason::External);
            }
        }
    }
    for c in conditions {
        if let StopCondition::MaxIterations(max) = c {
            if state.iteration >= *max {
                return Some(StopReason::MaxIterations);
            }
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
