// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::OnceLock;

use regex::Regex;

/// Fraction of the cap given to the head window; the remainder is tail.
/// Errors and summaries cluster at the end of command output, so the tail
/// is kept almost as large as the head.
const HEAD_FRACTION: f64 = 0.6;

/// Truncate `s` to at most `cap_bytes` of retained content.
///
/// Output at or under the cap is returned unchanged — in particular,
/// output *exactly* at the boundary gets no marker.  Oversized output
/// keeps a head and a tail window (split at char boundaries) joined by a
/// marker stating how many bytes were elided.
pub fn truncate_output(s: &str, cap_bytes: usize) -> String {
    if cap_bytes == 0 || s.len() <= cap_bytes {
        return s.to_string();
    }
    let head_budget = (cap_bytes as f64 * HEAD_FRACTION) as usize;
    let tail_budget = cap_bytes - head_budget;

    let head_end = floor_char_boundary(s, head_budget);
    let tail_start = ceil_char_boundary(s, s.len() - tail_budget);
    let elided = tail_start - head_end;

    format!(
        "{}\n[... {elided} bytes elided ...]\n{}",
        &s[..head_end],
        &s[tail_start..]
    )
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Strip ANSI escape sequences (CSI, OSC, and stray ESC-prefixed controls)
/// so captured subprocess output is plain text even when a tool ignores
/// `NO_COLOR`.
pub fn strip_ansi(s: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\x1b[@-_]")
            .expect("ANSI pattern compiles")
    });
    re.replace_all(s, "").into_owned()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_cap_is_unchanged() {
        assert_eq!(truncate_output("short", 100), "short");
    }

    #[test]
    fn exactly_at_cap_gets_no_marker() {
        let s = "x".repeat(100);
        let out = truncate_output(&s, 100);
        assert_eq!(out, s);
        assert!(!out.contains("elided"));
    }

    #[test]
    fn over_cap_keeps_head_and_tail() {
        let s = format!("HEAD{}TAIL", "m".repeat(1000));
        let out = truncate_output(&s, 100);
        assert!(out.starts_with("HEAD"));
        assert!(out.ends_with("TAIL"));
        assert!(out.contains("bytes elided"));
    }

    #[test]
    fn elided_byte_count_is_exact() {
        let s = "a".repeat(250);
        let out = truncate_output(&s, 100);
        // 250 total, 100 kept → 150 elided.
        assert!(out.contains("[... 150 bytes elided ...]"), "got: {out}");
    }

    #[test]
    fn multibyte_input_splits_on_char_boundaries() {
        let s = "é".repeat(300); // 2 bytes each
        let out = truncate_output(&s, 101);
        assert!(out.contains("elided"));
        // Must not panic and must remain valid UTF-8 (guaranteed by type).
    }

    #[test]
    fn zero_cap_disables_truncation() {
        let s = "x".repeat(500);
        assert_eq!(truncate_output(&s, 0), s);
    }

    #[test]
    fn strip_ansi_removes_color_codes() {
        let s = "\x1b[31mred\x1b[0m plain";
        assert_eq!(strip_ansi(s), "red plain");
    }

    #[test]
    fn strip_ansi_removes_osc_title() {
        let s = "\x1b]0;window title\x07output";
        assert_eq!(strip_ansi(s), "output");
    }

    #[test]
    fn strip_ansi_leaves_plain_text_alone() {
        assert_eq!(strip_ansi("nothing fancy"), "nothing fancy");
    }
}
