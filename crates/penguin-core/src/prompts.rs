// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT

/// Synthesized user turn injected between task iterations, after an action
/// batch has been observed.
pub const CONTINUATION_PROMPT: &str =
    "Continue with the task. Use the observations above; either invoke the \
     next actions you need or give your final answer.";

/// Stricter continuation used for the single empty-response recovery
/// iteration.
pub const RECOVERY_PROMPT: &str =
    "Your previous reply was empty. You must respond now: either invoke an \
     action or state your final answer in plain text. Do not send an empty \
     message.";
