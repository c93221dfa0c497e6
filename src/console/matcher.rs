//! Pattern matching over an append-only console byte buffer.
//!
//! The matcher never talks to the channel. The session feeds it chunks as
//! they arrive and asks whether the current [`ExpectSpec`] is satisfied.
//!
//! # Incremental scanning
//!
//! Within one wait, each search only covers bytes that were not examined
//! by the previous search, widened backwards just enough to catch matches
//! that straddle a chunk boundary:
//!
//! - literals: the last `len - 1` bytes before the scan frontier
//! - regexes: back to the start of the line containing the frontier, but
//!   never more than `max_lookback` bytes
//!
//! Regex patterns are therefore line-local: a regex that only matches
//! across a newline, or over a line longer than the lookback, is not
//! supported (literals may contain newlines).
//!
//! Output that can no longer take part in a match is discarded once the
//! buffer exceeds `max_buffer`. A capturing wait (used for command output)
//! keeps everything up to a much larger limit and records whether anything
//! had to be dropped anyway.
//!
//! # Tie-break
//!
//! The earliest match position in the buffer wins. When two patterns match
//! at the same position, the one registered first wins. Specs are authored
//! most-specific-first.

use regex::bytes::Regex;
use std::time::Duration;

use super::ansi::strip_ansi;
use crate::error::{Error, Result};

/// Buffer size past which already-scanned output is discarded.
const DEFAULT_MAX_BUFFER: usize = 64 * 1024;
/// How far a regex search may reach back before the scan frontier.
const DEFAULT_MAX_LOOKBACK: usize = 4 * 1024;
/// Buffer bound while capturing command output.
const DEFAULT_CAPTURE_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
enum Needle {
    Literal(Vec<u8>),
    Regex(Regex),
}

/// One recognisable piece of console output.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    needle: Needle,
}

impl Pattern {
    /// Match `text` byte-for-byte.
    pub fn literal(text: &str) -> Self {
        Self {
            source: text.to_string(),
            needle: Needle::Literal(text.as_bytes().to_vec()),
        }
    }

    /// Match a (line-local) regular expression.
    pub fn regex(expr: &str) -> Result<Self> {
        let regex = Regex::new(expr)
            .map_err(|e| Error::Config(format!("bad pattern {expr:?}: {e}")))?;
        Ok(Self {
            source: expr.to_string(),
            needle: Needle::Regex(regex),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn is_regex(&self) -> bool {
        matches!(self.needle, Needle::Regex(_))
    }

    fn literal_len(&self) -> usize {
        match &self.needle {
            Needle::Literal(bytes) => bytes.len(),
            Needle::Regex(_) => 0,
        }
    }

    /// First match in `hay` as (start, end).
    fn find(&self, hay: &[u8]) -> Option<(usize, usize)> {
        match &self.needle {
            Needle::Literal(needle) => {
                if needle.is_empty() || needle.len() > hay.len() {
                    return None;
                }
                hay.windows(needle.len())
                    .position(|w| w == needle.as_slice())
                    .map(|start| (start, start + needle.len()))
            }
            Needle::Regex(re) => re.find(hay).map(|m| (m.start(), m.end())),
        }
    }
}

/// Ordered set of acceptable next outputs plus how long to wait for them.
#[derive(Debug, Clone)]
pub struct ExpectSpec {
    entries: Vec<(String, Pattern)>,
    timeout: Duration,
    capture: bool,
}

impl ExpectSpec {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Vec::new(),
            timeout,
            capture: false,
        }
    }

    /// Register a labelled pattern. Registration order is the tie-break order.
    pub fn with(mut self, label: &str, pattern: Pattern) -> Self {
        self.entries.push((label.to_string(), pattern));
        self
    }

    /// Keep all output of this wait so it can be returned whole.
    pub fn capturing(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn captures_output(&self) -> bool {
        self.capture
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Same patterns, different wait.
    pub fn retimed(&self, timeout: Duration) -> Self {
        Self {
            entries: self.entries.clone(),
            timeout,
            capture: self.capture,
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(label, _)| label.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn has_regex(&self) -> bool {
        self.entries.iter().any(|(_, p)| p.is_regex())
    }

    fn max_literal_len(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, p)| p.literal_len())
            .max()
            .unwrap_or(0)
    }
}

/// Outcome of one wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    Matched {
        label: String,
        /// Output preceding the match, ANSI-stripped.
        before: String,
        /// The matched text itself.
        matched: String,
    },
    Timeout,
    Closed,
}

impl MatchResult {
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Matched { label, .. } => Some(label),
            _ => None,
        }
    }
}

/// Read buffer plus scan bookkeeping for one console.
#[derive(Debug)]
pub struct Matcher {
    buffer: Vec<u8>,
    /// Bytes before this offset were searched against the current spec.
    scanned: usize,
    max_buffer: usize,
    max_lookback: usize,
    capture_limit: usize,
    /// The current wait keeps everything up to `capture_limit`.
    capture: bool,
    /// Output of the current wait was discarded.
    dropped: bool,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Matcher {
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_BUFFER)
    }

    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self::with_limits(max_buffer, DEFAULT_CAPTURE_LIMIT)
    }

    pub fn with_limits(max_buffer: usize, capture_limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_buffer,
            max_lookback: DEFAULT_MAX_LOOKBACK.min(max_buffer),
            capture_limit: capture_limit.max(max_buffer),
            capture: false,
            dropped: false,
        }
    }

    /// Start a new wait. Leftover output is re-examined against the new spec.
    pub fn begin(&mut self) {
        self.scanned = 0;
        self.capture = false;
        self.dropped = false;
    }

    /// Start a wait whose output must survive until the match.
    pub fn begin_capture(&mut self) {
        self.begin();
        self.capture = true;
    }

    /// Whether the current wait lost output to the buffer bound.
    pub fn dropped_output(&self) -> bool {
        self.dropped
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Search the unscanned tail of the buffer. On a match the buffer is
    /// consumed through the end of the match.
    pub fn search(&mut self, spec: &ExpectSpec) -> Option<MatchResult> {
        let start = self.window_start(spec);
        let window = &self.buffer[start..];

        let mut best: Option<(usize, usize, usize)> = None;
        for (index, (_, pattern)) in spec.entries.iter().enumerate() {
            if let Some((s, e)) = pattern.find(window) {
                // strict `<` keeps the earlier registration on equal positions
                if best.map_or(true, |(bs, _, _)| s < bs) {
                    best = Some((s, e, index));
                }
            }
        }

        let Some((s, e, index)) = best else {
            self.scanned = self.buffer.len();
            let keep_from = self.window_start(spec);
            self.trim(keep_from);
            return None;
        };

        let (abs_start, abs_end) = (start + s, start + e);
        let before = strip_ansi(&self.buffer[..abs_start]);
        let matched = String::from_utf8_lossy(&self.buffer[abs_start..abs_end]).into_owned();
        self.buffer.drain(..abs_end);
        self.scanned = 0;

        Some(MatchResult::Matched {
            label: spec.entries[index].0.clone(),
            before,
            matched,
        })
    }

    fn window_start(&self, spec: &ExpectSpec) -> usize {
        let frontier = self.scanned.min(self.buffer.len());
        let start = frontier.saturating_sub(spec.max_literal_len().saturating_sub(1));
        if !spec.has_regex() {
            return start;
        }
        let floor = frontier.saturating_sub(self.max_lookback);
        let line_start = self.buffer[floor..frontier]
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(floor, |p| floor + p + 1);
        start.min(line_start)
    }

    /// Drop output before `keep_from` while the buffer is over its bound.
    fn trim(&mut self, keep_from: usize) {
        let limit = if self.capture {
            self.capture_limit
        } else {
            self.max_buffer
        };
        if self.buffer.len() <= limit {
            return;
        }
        let droppable = (self.buffer.len() - limit).min(keep_from);
        if droppable > 0 {
            self.buffer.drain(..droppable);
            self.scanned -= droppable;
            self.dropped = true;
        }
    }
}
