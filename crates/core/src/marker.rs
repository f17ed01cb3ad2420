//! Sentinel-delimited JSON blocks embedded in child stdout.
//!
//! The automation subprocess writes free-text log lines to stdout and,
//! between literal sentinel lines, JSON documents describing its progress
//! (`===JSON_PARTIAL_START===` … `===JSON_PARTIAL_END===`) and its final
//! result (`===JSON_RESULT_START===` … `===JSON_RESULT_END===`).
//!
//! [`MarkerParser`] is a line-at-a-time state machine (`Idle` /
//! `Capturing`) that turns the stream into [`MarkerEvent`]s. It never
//! fails: problems are reported as events and the caller decides whether
//! to log them or turn them into an error result.

use std::fmt;

use serde_json::Value;

use crate::protocol::{PARTIAL_END, PARTIAL_START, RESULT_END, RESULT_START};

/// Which kind of block a sentinel delimits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Partial,
    Result,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Partial => f.write_str("partial"),
            Self::Result => f.write_str("result"),
        }
    }
}

/// A block whose body could not be parsed as JSON.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Malformed {kind} block: {reason}")]
pub struct MalformedResult {
    pub kind: BlockKind,
    pub reason: String,
    /// Accumulated body text, kept for diagnostics.
    pub raw: String,
}

/// Output of [`MarkerParser::feed`] and [`MarkerParser::finish`].
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerEvent {
    /// A line outside any block, passed through unchanged.
    Line(String),
    /// A parsed partial-progress document.
    Partial(Value),
    /// The first parsed final-result document.
    Result(Value),
    /// A block that could not be turned into a document.
    Malformed(MalformedResult),
    /// A result block after the first one. Its content is discarded.
    DuplicateResult,
    /// An end sentinel that does not close an open block of its kind.
    StraySentinel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sentinel {
    Start(BlockKind),
    End(BlockKind),
}

fn classify(line: &str) -> Option<Sentinel> {
    match line.trim() {
        PARTIAL_START => Some(Sentinel::Start(BlockKind::Partial)),
        PARTIAL_END => Some(Sentinel::End(BlockKind::Partial)),
        RESULT_START => Some(Sentinel::Start(BlockKind::Result)),
        RESULT_END => Some(Sentinel::End(BlockKind::Result)),
        _ => None,
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Capturing { kind: BlockKind, lines: Vec<String> },
}

/// Line-oriented parser for the marker protocol.
#[derive(Debug)]
pub struct MarkerParser {
    state: State,
    result_seen: bool,
}

impl Default for MarkerParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerParser {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            result_seen: false,
        }
    }

    /// `true` once a result block has been closed, whether or not it parsed.
    pub fn result_seen(&self) -> bool {
        self.result_seen
    }

    /// Consume one stdout line (without its trailing newline).
    pub fn feed(&mut self, line: &str) -> Option<MarkerEvent> {
        let sentinel = classify(line);

        match (&mut self.state, sentinel) {
            (State::Idle, None) => Some(MarkerEvent::Line(line.to_string())),
            (State::Idle, Some(Sentinel::Start(kind))) => {
                self.state = State::Capturing {
                    kind,
                    lines: Vec::new(),
                };
                None
            }
            (State::Idle, Some(Sentinel::End(_))) => {
                Some(MarkerEvent::StraySentinel(line.trim().to_string()))
            }
            (State::Capturing { lines, .. }, None) => {
                lines.push(line.to_string());
                None
            }
            (State::Capturing { kind, .. }, Some(Sentinel::End(end))) if *kind == end => {
                let State::Capturing { kind, lines } =
                    std::mem::replace(&mut self.state, State::Idle)
                else {
                    return None;
                };
                Some(self.close_block(kind, lines))
            }
            (State::Capturing { .. }, Some(Sentinel::End(_))) => {
                Some(MarkerEvent::StraySentinel(line.trim().to_string()))
            }
            (State::Capturing { .. }, Some(Sentinel::Start(new_kind))) => {
                let previous = std::mem::replace(
                    &mut self.state,
                    State::Capturing {
                        kind: new_kind,
                        lines: Vec::new(),
                    },
                );
                match previous {
                    State::Capturing { kind, lines } => {
                        Some(MarkerEvent::Malformed(MalformedResult {
                            kind,
                            reason: "block abandoned by a new start sentinel".to_string(),
                            raw: lines.join("\n"),
                        }))
                    }
                    State::Idle => None,
                }
            }
        }
    }

    /// Signal end of stream.
    ///
    /// An unterminated block gets one best-effort parse of the outermost
    /// balanced `{...}` in its accumulated text.
    pub fn finish(&mut self) -> Option<MarkerEvent> {
        let State::Capturing { kind, lines } = std::mem::replace(&mut self.state, State::Idle)
        else {
            return None;
        };

        let raw = lines.join("\n");
        if kind == BlockKind::Result && self.result_seen {
            return Some(MarkerEvent::DuplicateResult);
        }
        if kind == BlockKind::Result {
            self.result_seen = true;
        }

        let parsed = match extract_braced(&raw) {
            Some(candidate) => serde_json::from_str::<Value>(candidate).map_err(|e| e.to_string()),
            None => Err("stream closed before the end sentinel and no balanced object was found"
                .to_string()),
        };

        Some(match parsed {
            Ok(doc) => block_event(kind, doc),
            Err(reason) => MarkerEvent::Malformed(MalformedResult { kind, reason, raw }),
        })
    }

    fn close_block(&mut self, kind: BlockKind, lines: Vec<String>) -> MarkerEvent {
        if kind == BlockKind::Result {
            if self.result_seen {
                return MarkerEvent::DuplicateResult;
            }
            self.result_seen = true;
        }

        let raw = lines.join("\n");
        match serde_json::from_str::<Value>(&raw) {
            Ok(doc) => block_event(kind, doc),
            Err(e) => MarkerEvent::Malformed(MalformedResult {
                kind,
                reason: e.to_string(),
                raw,
            }),
        }
    }
}

fn block_event(kind: BlockKind, doc: Value) -> MarkerEvent {
    match kind {
        BlockKind::Partial => MarkerEvent::Partial(doc),
        BlockKind::Result => MarkerEvent::Result(doc),
    }
}

/// Locate the outermost balanced `{...}` starting at the first `{`.
///
/// Braces inside JSON string literals are ignored. Returns `None` when the
/// first object never closes.
pub fn extract_braced(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
