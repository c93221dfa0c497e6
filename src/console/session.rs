//! Console session: the single owner of one guest console channel.
//!
//! # Ownership
//!
//! A session is driven by exactly one flow at a time. All operations take
//! `&mut self` and the type is not `Clone`, so two callers can never
//! interleave sends into the same guest input stream.
//!
//! # Lifecycle
//!
//! `close()` is idempotent and also runs on drop, so the channel is released
//! exactly once on every exit path: success, error, timeout or cancellation.
//! Sending after close fails with a channel error.

use std::time::{Duration, Instant};

use super::ansi::strip_ansi;
use super::channel::{ChannelRead, ConsoleChannel};
use super::matcher::{ExpectSpec, MatchResult, Matcher};
use crate::cancel::{CancelToken, POLL_SLICE};
use crate::error::{Error, Result};

/// Line terminator appended by `send`.
const LINE_ENDING: &str = "\n";

pub struct ConsoleSession {
    channel: Box<dyn ConsoleChannel>,
    endpoint: String,
    matcher: Matcher,
    default_timeout: Duration,
    cancel: CancelToken,
    closed: bool,
    /// Everything received, plus sends annotated as `>>> ...`.
    transcript: Vec<u8>,
    /// Prefix that hands a line from the device CLI to its shell (`run `).
    pub(crate) shell_prefix: String,
}

impl ConsoleSession {
    pub fn new(channel: Box<dyn ConsoleChannel>, cancel: CancelToken) -> Self {
        let endpoint = channel.endpoint().to_string();
        Self {
            channel,
            endpoint,
            matcher: Matcher::new(),
            default_timeout: Duration::from_secs(30),
            cancel,
            closed: false,
            transcript: Vec::new(),
            shell_prefix: String::new(),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_shell_prefix(mut self, prefix: &str) -> Self {
        self.shell_prefix = prefix.to_string();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[cfg(test)]
    pub(crate) fn with_matcher(mut self, matcher: Matcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Timeout for housekeeping commands such as `write_file`.
    pub(crate) fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write `text` plus a line terminator.
    pub fn send(&mut self, text: &str) -> Result<()> {
        tracing::debug!(endpoint = %self.endpoint, "send {:?}", text);
        self.send_raw(text, text)
    }

    /// Like `send`, but the text never reaches logs or the transcript.
    pub fn send_secret(&mut self, text: &str) -> Result<()> {
        tracing::debug!(endpoint = %self.endpoint, "send <secret>");
        self.send_raw(text, "<secret>")
    }

    fn send_raw(&mut self, text: &str, shown: &str) -> Result<()> {
        if self.closed {
            return Err(Error::Channel(format!(
                "send on closed console {}",
                self.endpoint
            )));
        }
        self.transcript
            .extend_from_slice(format!("\n>>> {}\n", shown).as_bytes());
        let line = format!("{}{}", text, LINE_ENDING);
        self.channel
            .write_all(line.as_bytes())
            .map_err(|e| Error::Channel(format!("write to {}: {}", self.endpoint, e)))
    }

    /// Wait for the first pattern of `spec` to show up.
    ///
    /// Returns `Err` only for cancellation or a session that is already
    /// closed; timeouts and a vanished channel are ordinary results.
    pub fn expect(&mut self, spec: &ExpectSpec) -> Result<MatchResult> {
        if self.closed {
            return Err(Error::Channel(format!(
                "expect on closed console {}",
                self.endpoint
            )));
        }

        if spec.captures_output() {
            self.matcher.begin_capture();
        } else {
            self.matcher.begin();
        }
        if let Some(found) = self.matcher.search(spec) {
            return Ok(self.log_match(found));
        }

        let deadline = Instant::now() + spec.timeout();
        loop {
            self.cancel.check()?;

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(
                    endpoint = %self.endpoint,
                    labels = ?spec.labels().collect::<Vec<_>>(),
                    "expect timed out after {:?}",
                    spec.timeout()
                );
                return Ok(MatchResult::Timeout);
            }

            match self.channel.read_chunk(POLL_SLICE.min(deadline - now)) {
                ChannelRead::Data(chunk) => {
                    self.transcript.extend_from_slice(&chunk);
                    self.matcher.feed(&chunk);
                    if let Some(found) = self.matcher.search(spec) {
                        return Ok(self.log_match(found));
                    }
                }
                ChannelRead::Idle => continue,
                ChannelRead::Closed => {
                    tracing::warn!(endpoint = %self.endpoint, "console stream closed during expect");
                    return Ok(MatchResult::Closed);
                }
            }
        }
    }

    fn log_match(&self, found: MatchResult) -> MatchResult {
        if let MatchResult::Matched { label, .. } = &found {
            tracing::debug!(endpoint = %self.endpoint, label = %label, "matched");
        }
        found
    }

    /// Release the channel. Later calls are no-ops.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::debug!(endpoint = %self.endpoint, "closing console");
        self.channel.close();
    }

    /// ANSI-stripped transcript of the whole session so far.
    pub fn transcript(&self) -> String {
        strip_ansi(&self.transcript)
    }

    /// Whether the last capturing wait had to discard output.
    pub(crate) fn output_dropped(&self) -> bool {
        self.matcher.dropped_output()
    }
}

impl Drop for ConsoleSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::matcher::Pattern;
    use crate::console::testing::ScriptedChannel;

    fn login_spec(timeout: Duration) -> ExpectSpec {
        ExpectSpec::new(timeout)
            .with("username", Pattern::literal("Username:"))
            .with("password", Pattern::literal("Password:"))
    }

    #[test]
    fn test_expect_matches_fragmented_output() {
        let script = ScriptedChannel::new()
            .chunk("RP/0/RP0/CPU0 boot\r\nUse")
            .chunk("rna")
            .chunk("me: ");
        let mut session = ConsoleSession::new(Box::new(script), CancelToken::new());

        let result = session.expect(&login_spec(Duration::from_secs(2))).unwrap();
        assert_eq!(result.label(), Some("username"));
    }

    #[test]
    fn test_expect_times_out_within_slop() {
        let script = ScriptedChannel::new().chunk("nothing useful\r\n");
        let mut session = ConsoleSession::new(Box::new(script), CancelToken::new());

        let start = Instant::now();
        let result = session.expect(&login_spec(Duration::from_millis(300))).unwrap();
        let elapsed = start.elapsed();

        assert_eq!(result, MatchResult::Timeout);
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(300) + Duration::from_millis(250));
    }

    #[test]
    fn test_expect_reports_closed_stream() {
        let script = ScriptedChannel::new().chunk("partial").hang_up();
        let mut session = ConsoleSession::new(Box::new(script), CancelToken::new());
        assert_eq!(
            session.expect(&login_spec(Duration::from_secs(5))).unwrap(),
            MatchResult::Closed
        );
    }

    #[test]
    fn test_close_once_on_normal_completion() {
        let script = ScriptedChannel::new().chunk("Username:");
        let probe = script.probe();
        {
            let mut session = ConsoleSession::new(Box::new(script), CancelToken::new());
            session.expect(&login_spec(Duration::from_secs(1))).unwrap();
            session.send("vagrant").unwrap();
            session.close();
            session.close();
            assert!(matches!(session.send("late"), Err(Error::Channel(_))));
        }
        assert_eq!(probe.closes(), 1);
        assert_eq!(probe.sends(), vec!["vagrant".to_string()]);
    }

    #[test]
    fn test_close_once_on_timeout_and_drop() {
        let script = ScriptedChannel::new();
        let probe = script.probe();
        {
            let mut session = ConsoleSession::new(Box::new(script), CancelToken::new());
            let result = session.expect(&login_spec(Duration::from_millis(50))).unwrap();
            assert_eq!(result, MatchResult::Timeout);
        }
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn test_cancel_interrupts_expect_and_closes_once() {
        let script = ScriptedChannel::new();
        let probe = script.probe();
        let cancel = CancelToken::new();
        let remote = cancel.clone();

        let handle = std::thread::spawn(move || {
            let mut session = ConsoleSession::new(Box::new(script), cancel);
            let start = Instant::now();
            let result = session.expect(&login_spec(Duration::from_secs(30)));
            (result.map_err(|e| e.kind()), start.elapsed())
        });

        std::thread::sleep(Duration::from_millis(100));
        remote.cancel();
        let (result, elapsed) = handle.join().unwrap();

        assert_eq!(result, Err("cancelled"));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(probe.closes(), 1);
        assert!(probe.sends().is_empty());
    }

    #[test]
    fn test_secret_is_masked_in_transcript() {
        let script = ScriptedChannel::new();
        let probe = script.probe();
        let mut session = ConsoleSession::new(Box::new(script), CancelToken::new());
        session.send_secret("hunter2").unwrap();
        assert!(!session.transcript().contains("hunter2"));
        assert!(session.transcript().contains("<secret>"));
        assert_eq!(probe.sends(), vec!["hunter2".to_string()]);
    }
}
