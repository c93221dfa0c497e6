//! Retry policies.
//!
//! A policy turns an observed outcome into a disposition: retry after a
//! delay, give up, or done. Callers own the sleeping (so it stays
//! cancellable) and the loop; the policy owns the counting.
//!
//! Two policies exist:
//!
//! - [`BoundedExponential`] for generic transient failures (console not
//!   reachable yet, management service not up yet). Caps both attempts and
//!   total elapsed time.
//! - [`ContentionPolling`] for configuration application. "Still converging"
//!   and "lock contention" are expected long-running guest states, not
//!   failures, so they are polled at a fixed delay with no attempt cap. Only
//!   an explicit failure or the overall deadline ends the loop.

use std::time::{Duration, Instant};

/// What the caller saw on its latest attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Success,
    /// Generic transient failure (refused connection, no banner yet).
    Transient(String),
    /// Guest configuration engine still converging on earlier work.
    Converging(String),
    /// Guest configuration lock held by someone else.
    Contended(String),
    /// Explicit failure marker.
    Failed(String),
}

/// Policy verdict for one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Retry(Duration),
    Fatal(String),
    Success,
}

/// Classification of the latest observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    Fatal,
    Success,
}

/// Counters for one logical operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Unsuccessful observations so far.
    pub attempts: u32,
    /// Retry dispositions handed out.
    pub retries: u32,
    /// `None` means bounded only by the deadline.
    pub max_attempts: Option<u32>,
    pub backoff: Duration,
    pub last: Option<Classification>,
}

pub trait RetryPolicy {
    fn classify(&mut self, outcome: &Observation) -> Disposition;

    /// Delay the next `Retry` would carry.
    fn next_backoff(&self) -> Duration;

    fn state(&self) -> &RetryState;
}

/// Exponential backoff capped by attempt count and total elapsed time.
#[derive(Debug, Clone)]
pub struct BoundedExponential {
    state: RetryState,
    max_backoff: Duration,
    max_elapsed: Duration,
    started: Instant,
}

impl BoundedExponential {
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        max_elapsed: Duration,
    ) -> Self {
        Self {
            state: RetryState {
                attempts: 0,
                retries: 0,
                max_attempts: Some(max_attempts),
                backoff: initial_backoff,
                last: None,
            },
            max_backoff,
            max_elapsed,
            started: Instant::now(),
        }
    }

    fn fatal(&mut self, reason: String) -> Disposition {
        self.state.last = Some(Classification::Fatal);
        Disposition::Fatal(reason)
    }
}

impl RetryPolicy for BoundedExponential {
    fn classify(&mut self, outcome: &Observation) -> Disposition {
        let reason = match outcome {
            Observation::Success => {
                self.state.last = Some(Classification::Success);
                return Disposition::Success;
            }
            Observation::Failed(reason) => return self.fatal(reason.clone()),
            Observation::Transient(reason)
            | Observation::Converging(reason)
            | Observation::Contended(reason) => reason,
        };

        self.state.attempts += 1;
        let max = self.state.max_attempts.unwrap_or(u32::MAX);
        if self.state.attempts >= max {
            return self.fatal(format!(
                "gave up after {} attempts: {}",
                self.state.attempts, reason
            ));
        }

        let delay = self.state.backoff;
        if self.started.elapsed().saturating_add(delay) > self.max_elapsed {
            return self.fatal(format!(
                "gave up after {:?} ({} attempts): {}",
                self.max_elapsed, self.state.attempts, reason
            ));
        }

        self.state.retries += 1;
        self.state.last = Some(Classification::Retryable);
        self.state.backoff = delay.saturating_mul(2).min(self.max_backoff);
        Disposition::Retry(delay)
    }

    fn next_backoff(&self) -> Duration {
        self.state.backoff
    }

    fn state(&self) -> &RetryState {
        &self.state
    }
}

/// Fixed-delay polling bounded only by an overall deadline.
#[derive(Debug, Clone)]
pub struct ContentionPolling {
    state: RetryState,
    deadline: Duration,
    started: Instant,
}

impl ContentionPolling {
    pub fn new(delay: Duration, deadline: Duration) -> Self {
        Self {
            state: RetryState {
                attempts: 0,
                retries: 0,
                max_attempts: None,
                backoff: delay,
                last: None,
            },
            deadline,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl RetryPolicy for ContentionPolling {
    fn classify(&mut self, outcome: &Observation) -> Disposition {
        match outcome {
            Observation::Success => {
                self.state.last = Some(Classification::Success);
                Disposition::Success
            }
            Observation::Converging(reason) | Observation::Contended(reason) => {
                self.state.attempts += 1;
                if self.started.elapsed().saturating_add(self.state.backoff) > self.deadline {
                    self.state.last = Some(Classification::Fatal);
                    return Disposition::Fatal(format!(
                        "deadline of {:?} exceeded after {} attempts, last: {}",
                        self.deadline, self.state.attempts, reason
                    ));
                }
                self.state.retries += 1;
                self.state.last = Some(Classification::Retryable);
                Disposition::Retry(self.state.backoff)
            }
            Observation::Transient(reason) | Observation::Failed(reason) => {
                self.state.attempts += 1;
                self.state.last = Some(Classification::Fatal);
                Disposition::Fatal(reason.clone())
            }
        }
    }

    fn next_backoff(&self) -> Duration {
        self.state.backoff
    }

    fn state(&self) -> &RetryState {
        &self.state
    }
}
