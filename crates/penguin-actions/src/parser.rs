// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

/// A tag the host has taught the parser to recognise.  `param_hint` is
/// advisory only — used for help text, never for parse-time validation.
#[derive(Debug, Clone)]
pub struct TagSpec {
    pub name: String,
    pub param_hint: String,
}

/// Why a scanned region could not be turned into a well-formed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionErrorKind {
    /// An opening tag was never closed; the action carries the raw
    /// remainder as params and is surfaced as failed at execution time.
    ParseUnterminated,
}

impl ActionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseUnterminated => "parse_unterminated",
        }
    }
}

/// One parsed invocation from assistant output.
#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    /// Raw parameter text between the tags.  Tool-specific micro-schemas
    /// are interpreted by the handler, and malformed params surface there,
    /// not here.
    pub params: String,
    /// Byte span of the whole tagged region in the source message, for
    /// error reporting.
    pub span: (usize, usize),
    pub error_kind: Option<ActionErrorKind>,
}

/// Scans assistant messages for registered tagged regions.
///
/// The scan is single-pass, non-greedy, deterministic and reentrant.
/// Balanced nesting of the *same* tag is tracked so `<run><run>x</run></run>`
/// parses as one action whose params contain the inner region.  A `\<`
/// escape suppresses recognition.  Unknown tags are plain text.
#[derive(Debug, Default)]
pub struct ActionParser {
    tags: HashMap<String, TagSpec>,
}

impl ActionParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, param_hint: impl Into<String>) {
        let name = name.into();
        self.tags.insert(
            name.clone(),
            TagSpec {
                name,
                param_hint: param_hint.into(),
            },
        );
    }

    pub fn tag(&self, name: &str) -> Option<&TagSpec> {
        self.tags.get(name)
    }

    pub fn tag_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tags.keys().cloned().collect();
        names.sort();
        names
    }

    /// Lazily scan `text` left to right, yielding actions in order.
    pub fn scan<'p, 't>(&'p self, text: &'t str) -> ActionScan<'p, 't> {
        ActionScan {
            parser: self,
            text,
            pos: 0,
        }
    }

    /// Eagerly collect every action in `text`.
    pub fn parse(&self, text: &str) -> Vec<Action> {
        self.scan(text).collect()
    }

    /// Candidate tag name opening at byte `pos` (which must point at `<`).
    fn open_tag_at(&self, text: &str, pos: usize) -> Option<&str> {
        let rest = &text[pos + 1..];
        let end = rest.find('>')?;
        let candidate = &rest[..end];
        if candidate.is_empty() || candidate.starts_with('/') {
            return None;
        }
        self.tags.get(candidate).map(|t| t.name.as_str())
    }
}

pub struct ActionScan<'p, 't> {
    parser: &'p ActionParser,
    text: &'t str,
    pos: usize,
}

impl Iterator for ActionScan<'_, '_> {
    type Item = Action;

    fn next(&mut self) -> Option<Action> {
        let text = self.text;
        while self.pos < text.len() {
            let Some(rel) = text[self.pos..].find('<') else {
                self.pos = text.len();
                return None;
            };
            let open_start = self.pos + rel;

            // Backslash escape: `\<` is literal text.
            if open_start > 0 && text.as_bytes()[open_start - 1] == b'\\' {
                self.pos = open_start + 1;
                continue;
            }

            let Some(name) = self.parser.open_tag_at(text, open_start) else {
                self.pos = open_start + 1;
                continue;
            };

            let open_tag = format!("<{name}>");
            let close_tag = format!("</{name}>");
            let body_start = open_start + open_tag.len();

            // Track balanced same-tag nesting from the body onward.
            let mut depth = 1usize;
            let mut cursor = body_start;
            while depth > 0 {
                let next_open = text[cursor..].find(&open_tag).map(|i| cursor + i);
                let next_close = text[cursor..].find(&close_tag).map(|i| cursor + i);
                match (next_open, next_close) {
                    (Some(o), Some(c)) if o < c => {
                        depth += 1;
                        cursor = o + open_tag.len();
                    }
                    (_, Some(c)) => {
                        depth -= 1;
                        cursor = c + close_tag.len();
                        if depth == 0 {
                            self.pos = cursor;
                            let params_end = c;
                            return Some(Action {
                                name: name.to_string(),
                                params: text[body_start..params_end].to_string(),
                                span: (open_start, cursor),
                                error_kind: None,
                            });
                        }
                    }
                    (_, None) => {
                        // Unterminated: one error action, then the scan ends.
                        self.pos = text.len();
                        return Some(Action {
                            name: name.to_string(),
                            params: text[body_start..].to_string(),
                            span: (open_start, text.len()),
                            error_kind: Some(ActionErrorKind::ParseUnterminated),
                        });
                    }
                }
            }
        }
        None
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
