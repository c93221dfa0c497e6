//! Guest shell commands over the console.
//!
//! Each command is wrapped between unique markers so its output and exit
//! status can be cut out of whatever else the console prints:
//!
//! ```text
//! run echo '___START_<id>___'; <command>; echo '___DONE_<id>___' $?
//! ```
//!
//! The terminal echoes the command line back, but in the echo the done
//! marker is followed by `' $?`, never by a number, so only the real
//! completion line matches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::matcher::{ExpectSpec, MatchResult, Pattern};
use super::session::ConsoleSession;
use crate::error::{Error, Result};

static MARKER_SEQ: AtomicU64 = AtomicU64::new(0);

/// First line of an output whose beginning was discarded.
pub const TRUNCATED_NOTE: &str = "[earlier output discarded: console buffer limit reached]";

/// Result of one marker-delimited command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// The done marker was seen before the timeout.
    pub completed: bool,
    /// Exit status, -1 when not completed.
    pub exit_code: i32,
    /// Output between the markers, ANSI-stripped, marker lines removed.
    /// Starts with [`TRUNCATED_NOTE`] when `truncated`.
    pub output: String,
    /// The start of the output was lost to the console buffer limit.
    pub truncated: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.completed && self.exit_code == 0
    }
}

/// Microsecond timestamp, 0 if the clock is unavailable.
fn timestamp_micros() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0)
}

/// Unique (start, done) marker pair. Unique across threads too, since
/// several guests may be driven at once.
pub fn generate_command_markers() -> (String, String) {
    let id = format!(
        "{}_{}",
        timestamp_micros(),
        MARKER_SEQ.fetch_add(1, Ordering::Relaxed)
    );
    (format!("___START_{}___", id), format!("___DONE_{}___", id))
}

pub fn is_marker_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.contains("___START_") || trimmed.contains("___DONE_")
}

/// Escape `content` for a double-quoted `printf` format string.
fn printf_escape(content: &str) -> String {
    content
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('`', "\\`")
        .replace('%', "%%")
        .replace('\n', "\\n")
}

/// Cut the command's own output out of everything seen before the done marker.
fn extract_output(before: &str, start_marker: &str) -> String {
    let lines: Vec<&str> = before.lines().collect();
    let from = lines
        .iter()
        .rposition(|l| l.trim() == start_marker)
        .map_or(0, |i| i + 1);

    let mut output = String::new();
    for line in &lines[from..] {
        if is_marker_line(line) {
            continue;
        }
        output.push_str(line);
        output.push('\n');
    }
    output
}

impl ConsoleSession {
    /// Run `command` in the guest shell and capture output plus exit code.
    ///
    /// A timeout is reported as an incomplete result, not an error. A closed
    /// console is an error.
    pub fn exec(&mut self, command: &str, timeout: Duration) -> Result<CommandResult> {
        let prefix = self.shell_prefix.clone();
        self.exec_in(&prefix, command, timeout)
    }

    /// [`exec`](Self::exec) through another shell entry than the session's,
    /// e.g. `bash -c ` for the host namespace.
    pub fn exec_in(&mut self, prefix: &str, command: &str, timeout: Duration) -> Result<CommandResult> {
        let (start_marker, done_marker) = generate_command_markers();
        let line = format!(
            "{}echo '{}'; {}; echo '{}' $?",
            prefix, start_marker, command, done_marker
        );

        let spec = ExpectSpec::new(timeout)
            .with(
                "done",
                Pattern::regex(&format!(r"{} (-?\d+)\r?\n", done_marker))?,
            )
            .capturing();

        self.send(&line)?;
        match self.expect(&spec)? {
            MatchResult::Matched {
                before, matched, ..
            } => {
                let exit_code = matched
                    .split_whitespace()
                    .last()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(-1);
                let truncated = self.output_dropped();
                let mut output = extract_output(&before, &start_marker);
                if truncated {
                    tracing::warn!(endpoint = %self.endpoint(), "output of `{}` exceeded the console buffer", command);
                    output.insert_str(0, &format!("{}\n", TRUNCATED_NOTE));
                }
                Ok(CommandResult {
                    completed: true,
                    exit_code,
                    output,
                    truncated,
                })
            }
            MatchResult::Timeout => {
                tracing::warn!(endpoint = %self.endpoint(), "command did not complete within {:?}: {}", timeout, command);
                Ok(CommandResult {
                    completed: false,
                    exit_code: -1,
                    output: String::new(),
                    truncated: false,
                })
            }
            MatchResult::Closed => Err(Error::Channel(format!(
                "console {} closed while running: {}",
                self.endpoint(),
                command
            ))),
        }
    }

    /// Run a command that must succeed; returns its output.
    pub fn exec_ok(&mut self, command: &str, timeout: Duration) -> Result<String> {
        let prefix = self.shell_prefix.clone();
        self.exec_ok_in(&prefix, command, timeout)
    }

    pub fn exec_ok_in(&mut self, prefix: &str, command: &str, timeout: Duration) -> Result<String> {
        let result = self.exec_in(prefix, command, timeout)?;
        if !result.completed {
            return Err(Error::PatternTimeout {
                context: format!("running `{}`", command),
                waited: timeout,
            });
        }
        if result.exit_code != 0 {
            return Err(Error::CommandFailed {
                command: command.to_string(),
                exit_code: result.exit_code,
                output: result.output,
            });
        }
        Ok(result.output)
    }

    /// Write a file in the guest through `printf`.
    pub fn write_file(&mut self, path: &str, content: &str) -> Result<()> {
        let cmd = format!("printf \"{}\" > {}", printf_escape(content), path);
        let timeout = self.default_timeout();
        self.exec_ok(&cmd, timeout)?;
        Ok(())
    }
}
