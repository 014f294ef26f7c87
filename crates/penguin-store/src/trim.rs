// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use penguin_model::{Message, MessageType, Role};
use penguin_config::{ContextConfig, TrimPolicy};

/// Project a conversation into a token-bounded context window.
///
/// Pure function over the visible branch: the underlying log is never
/// mutated by trimming.  The projection preserves, in order:
///
/// 1. the system preamble (leading run of system messages),
/// 2. pinned messages, wherever they sit,
/// 3. the recent tail (`keep_recent` messages, extended backward so an
///    observation is never separated from the action turn it answers),
///
/// and replaces the remaining middle with a single status notice — either a
/// bare elision marker (`drop_middle`) or a role-labelled digest of what
/// was removed (`summarize_middle`).
pub fn context_window(messages: &[Message], cfg: &ContextConfig) -> Vec<Message> {
    let total: usize = messages.iter().map(|m| m.approx_tokens()).sum();
    if total <= cfg.max_tokens || messages.is_empty() {
        return messages.to_vec();
    }

    // Leading run of system messages is the preamble.
    let preamble_len = messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count();
    let body = &messages[preamble_len..];

    // Tail split point, moved backward off tool-result boundaries so the
    // window never opens with an observation whose action was elided.
    let mut tail_start = body.len().saturating_sub(cfg.keep_recent);
    while tail_start > 0 && tail_start < body.len() && body[tail_start].role == Role::Tool {
        tail_start -= 1;
    }

    let (middle, tail) = body.split_at(tail_start);
    let kept_middle: Vec<&Message> = middle.iter().filter(|m| is_pinned(m)).collect();
    let elided: Vec<&Message> = middle.iter().filter(|m| !is_pinned(m)).collect();

    let mut out: Vec<Message> = messages[..preamble_len].to_vec();
    out.extend(kept_middle.into_iter().cloned());
    if !elided.is_empty() {
        out.push(elision_notice(&elided, cfg.trim_policy));
    }
    out.extend(tail.iter().cloned());

    // If the tail alone still busts the budget, shed from its front —
    // always keeping the final message so the model sees the latest turn.
    let mut used: usize = out.iter().map(|m| m.approx_tokens()).sum();
    while used > cfg.max_tokens && out.len() > preamble_len + 2 {
        // Index of the first shed candidate: after preamble and the notice.
        let idx = out
            .iter()
            .enumerate()
            .skip(preamble_len)
            .position(|(i, m)| {
                i + 1 < out.len() && m.message_type != MessageType::Status && !is_pinned(m)
            });
        match idx {
            Some(p) => {
                let removed = out.remove(p + preamble_len);
                used -= removed.approx_tokens();
            }
            None => break,
        }
    }
    out
}

fn is_pinned(m: &Message) -> bool {
    m.metadata
        .get("pinned")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn elision_notice(elided: &[&Message], policy: TrimPolicy) -> Message {
    let text = match policy {
        TrimPolicy::DropMiddle => format!(
            "[{} earlier messages elided to fit the context window]",
            elided.len()
        ),
        TrimPolicy::SummarizeMiddle => {
            let mut lines = vec![format!(
                "[{} earlier messages compacted; digest follows]",
                elided.len()
            )];
            for m in elided {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                    Role::System => "system",
                };
                let full = m.content.to_text();
                let first = full.lines().next().unwrap_or("");
                let mut line: String = first.chars().take(80).collect();
                if first.chars().count() > 80 || full.lines().count() > 1 {
                    line.push('…');
                }
                lines.push(format!("- {role}: {line}"));
            }
            lines.join("\n")
        }
    };
    Message::system(text).with_type(MessageType::Status)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use penguin_config::{ContextConfig, TrimPolicy};

    fn cfg(max_tokens: usize, keep_recent: usize, policy: TrimPolicy) -> ContextConfig {
        ContextConfig {
            max_tokens,
            trim_policy: policy,
            keep_recent,
        }
    }

    fn convo(n: usize) -> Vec<Message> {
        let mut msgs = vec![Message::system("you are a helpful agent")];
        for i in 0..n {
            msgs.push(Message::user(format!("question {i} with some padding text")));
            msgs.push(Message::assistant(format!("answer {i} with some padding text")));
        }
        msgs
    }

    #[test]
    fn under_budget_is_identity() {
        let msgs = convo(2);
        let out = context_window(&msgs, &cfg(100_000, 4, TrimPolicy::DropMiddle));
        assert_eq!(out.len(), msgs.len());
    }

    #[test]
    fn over_budget_preserves_preamble_and_tail() {
        let msgs = convo(20);
        let out = context_window(&msgs, &cfg(100, 4, TrimPolicy::DropMiddle));
        assert_eq!(out[0].role, Role::System, "preamble survives");
        // The last original message survives.
        assert_eq!(
            out.last().unwrap().as_text(),
            msgs.last().unwrap().as_text()
        );
        // And one status notice marks the elision.
        assert_eq!(
            out.iter()
                .filter(|m| m.message_type == MessageType::Status)
                .count(),
            1
        );
    }

    #[test]
    fn drop_middle_notice_counts_messages() {
        let msgs = convo(10);
        let out = context_window(&msgs, &cfg(60, 2, TrimPolicy::DropMiddle));
        let notice = out
            .iter()
            .find(|m| m.message_type == MessageType::Status)
            .unwrap();
        assert!(notice.as_text().unwrap().contains("elided"));
    }

    #[test]
    fn summarize_middle_digest_lists_roles() {
        let msgs = convo(10);
        let out = context_window(&msgs, &cfg(120, 2, TrimPolicy::SummarizeMiddle));
        let notice = out
            .iter()
            .find(|m| m.message_type == MessageType::Status)
            .unwrap();
        let text = notice.as_text().unwrap();
        assert!(text.contains("- user: question 0"), "digest: {text}");
        assert!(text.contains("- assistant: answer 0"), "digest: {text}");
    }

    #[test]
    fn pinned_messages_survive_the_middle() {
        let mut msgs = convo(10);
        msgs[3] = Message::user("PINNED FACT that must survive")
            .with_meta("pinned", serde_json::Value::Bool(true));
        let out = context_window(&msgs, &cfg(100, 2, TrimPolicy::DropMiddle));
        assert!(
            out.iter()
                .any(|m| m.as_text() == Some("PINNED FACT that must survive")),
            "pinned message was trimmed away"
        );
    }

    #[test]
    fn tail_never_starts_with_orphan_observation() {
        let mut msgs = convo(6);
        // Place an observation just before the keep_recent boundary.
        let obs = Message::observation("run", "tool output here").with_agent("a1");
        msgs.insert(msgs.len() - 2, obs);
        let out = context_window(&msgs, &cfg(60, 2, TrimPolicy::DropMiddle));
        // Find first non-preamble, non-notice message: must not be tool role.
        let first_tail = out
            .iter()
            .find(|m| m.role != Role::System && m.message_type != MessageType::Status);
        if let Some(m) = first_tail {
            assert_ne!(m.role, Role::Tool, "window starts with orphan observation");
        }
    }

    #[test]
    fn trimming_does_not_mutate_input() {
        let msgs = convo(10);
        let before = serde_json::to_string(&msgs).unwrap();
        let _ = context_window(&msgs, &cfg(50, 2, TrimPolicy::DropMiddle));
        assert_eq!(serde_json::to_string(&msgs).unwrap(), before);
    }
}
