// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be on unless explicitly disabled
/// need a named function.
fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_action_timeout_secs() -> u64 {
    60
}

fn default_action_output_cap() -> usize {
    20_000
}

fn default_context_max_tokens() -> usize {
    128_000
}

fn default_keep_recent() -> usize {
    8
}

fn default_auto_every() -> u32 {
    5
}

fn default_retention_hours() -> u64 {
    72
}

fn default_min_auto_kept() -> usize {
    3
}

fn default_manual_max_age_hours() -> u64 {
    24 * 30
}

fn default_coalesce_chars() -> usize {
    64
}

fn default_coalesce_ms() -> u64 {
    50
}

fn default_queue_max() -> usize {
    256
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub bus: BusConfig,
    /// Default model selection handed to the gateway when an agent spec does
    /// not carry its own.
    #[serde(default)]
    pub model: ModelConfig,
}

/// Bounds and policies for the reason→act→observe loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default iteration bound for bounded tasks.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Textual marker that terminates a bounded task successfully when it
    /// appears in assistant output, even if no other stop condition fired.
    pub completion_phrase: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// When the model returns only whitespace, force one recovery iteration
    /// with a stricter continuation prompt before failing the task.
    #[serde(default = "default_true")]
    pub empty_response_recovery: bool,
    /// Per-action execution timeout.
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
    /// Byte ceiling for captured action output; larger output is truncated
    /// to a head/tail window with an elision marker.
    #[serde(default = "default_action_output_cap")]
    pub action_output_cap_bytes: usize,
    /// Promote action execution failures to task-fatal.  Off by default:
    /// failures surface as observations and the loop continues.
    #[serde(default)]
    pub action_failure_fatal: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            completion_phrase: None,
            retry: RetryConfig::default(),
            empty_response_recovery: true,
            action_timeout_secs: default_action_timeout_secs(),
            action_output_cap_bytes: default_action_output_cap(),
            action_failure_fatal: false,
        }
    }
}

/// Transient provider-failure policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubled on each subsequent attempt.
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

/// How the middle of an over-budget conversation is projected away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimPolicy {
    /// Replace the middle with a single elision notice.
    #[default]
    DropMiddle,
    /// Replace the middle with a deterministic role-labelled digest.
    SummarizeMiddle,
}

/// Context-window projection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Token budget for the projected window handed to the gateway.
    #[serde(default = "default_context_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub trim_policy: TrimPolicy,
    /// Recent tail preserved verbatim by trimming.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_context_max_tokens(),
            trim_policy: TrimPolicy::default(),
            keep_recent: default_keep_recent(),
        }
    }
}

/// Auto-checkpoint cadence and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Create an auto checkpoint every N assistant messages.  0 disables.
    #[serde(default = "default_auto_every")]
    pub auto_every: u32,
    /// Auto checkpoints older than this are pruned by the cleanup pass.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    /// Floor count of auto checkpoints kept per session regardless of age.
    #[serde(default = "default_min_auto_kept")]
    pub min_auto_kept: usize,
    /// Manual checkpoints younger than this are never pruned.
    #[serde(default = "default_manual_max_age_hours")]
    pub manual_max_age_hours: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            auto_every: default_auto_every(),
            retention_hours: default_retention_hours(),
            min_auto_kept: default_min_auto_kept(),
            manual_max_age_hours: default_manual_max_age_hours(),
        }
    }
}

/// What happens when a second live stream is started for a target that
/// already has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrentStreamPolicy {
    /// Deterministically cancel the live stream before starting the new one.
    #[default]
    CancelPrevious,
    /// Refuse the new stream with a concurrent-stream violation.
    Fail,
}

/// Emission coalescing for streamed deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Flush buffered deltas once this many characters are pending.
    #[serde(default = "default_coalesce_chars")]
    pub coalesce_chars: usize,
    /// ... or once this much time has passed since the last flush,
    /// whichever comes first.
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: u64,
    #[serde(default)]
    pub concurrent_policy: ConcurrentStreamPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            coalesce_chars: default_coalesce_chars(),
            coalesce_ms: default_coalesce_ms(),
            concurrent_policy: ConcurrentStreamPolicy::default(),
        }
    }
}

/// Overflow handling for event-bus subscriber queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued event and count the drop.
    #[default]
    DropOldest,
    /// Close the lagging subscription; its next receive reports overflow.
    Fail,
}

/// Queue bounds for both buses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Per-subscriber (event bus) and per-recipient (message bus) queue cap.
    #[serde(default = "default_queue_max")]
    pub queue_max: usize,
    #[serde(default)]
    pub drop_policy: DropPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_max: default_queue_max(),
            drop_policy: DropPolicy::default(),
        }
    }
}

/// Model selection forwarded to the gateway.  The core never interprets
/// `provider`/`name` beyond passing them through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub name: String,
    /// Environment variable that holds the API key (read by the gateway).
    pub api_key_env: Option<String>,
    /// Base URL override for self-hosted or proxied endpoints.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "mock".into(),
            name: "mock-model".into(),
            api_key_env: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_yields_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.engine.max_iterations, 10);
        assert_eq!(cfg.engine.retry.max_attempts, 3);
        assert!(cfg.engine.empty_response_recovery);
        assert_eq!(cfg.context.trim_policy, TrimPolicy::DropMiddle);
        assert_eq!(cfg.bus.drop_policy, DropPolicy::DropOldest);
        assert_eq!(
            cfg.stream.concurrent_policy,
            ConcurrentStreamPolicy::CancelPrevious
        );
    }

    #[test]
    fn engine_keys_deserialize() {
        let cfg: Config = serde_yaml::from_str(
            "engine:\n  max_iterations: 4\n  completion_phrase: DONE_OK\n  retry:\n    max_attempts: 7\n    base_delay_ms: 10",
        )
        .unwrap();
        assert_eq!(cfg.engine.max_iterations, 4);
        assert_eq!(cfg.engine.completion_phrase.as_deref(), Some("DONE_OK"));
        assert_eq!(cfg.engine.retry.max_attempts, 7);
        assert_eq!(cfg.engine.retry.base_delay_ms, 10);
    }

    #[test]
    fn trim_policy_snake_case_names() {
        let cfg: Config =
            serde_yaml::from_str("context:\n  trim_policy: summarize_middle").unwrap();
        assert_eq!(cfg.context.trim_policy, TrimPolicy::SummarizeMiddle);
    }

    #[test]
    fn drop_policy_fail_parses() {
        let cfg: Config = serde_yaml::from_str("bus:\n  drop_policy: fail").unwrap();
        assert_eq!(cfg.bus.drop_policy, DropPolicy::Fail);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg: Config = serde_yaml::from_str("checkpoint:\n  auto_every: 2").unwrap();
        assert_eq!(cfg.checkpoint.auto_every, 2);
        assert_eq!(cfg.checkpoint.min_auto_kept, 3);
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let cfg = Config::default();
        let text = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.context.max_tokens, cfg.context.max_tokens);
        assert_eq!(back.stream.coalesce_chars, cfg.stream.coalesce_chars);
    }
}
