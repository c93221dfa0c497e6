//! Installation director.
//!
//! # Overview
//!
//! First boot of a network OS is a conversation over the serial console:
//! banners, account creation, login, and whatever the image decides to print
//! in between. The director walks an [`InstallScript`], a graph of named
//! [`InstallStep`]s. Each step waits for one of its patterns, performs at most
//! one send, and follows the branch keyed by the matched label (or its
//! timeout branch when nothing matched).
//!
//! The graph may contain cycles. Staying in the same step is bounded by a
//! per-step consecutive repeat limit, and the whole run by an overall
//! deadline, so a wedged guest always ends in `install-failed`.
//!
//! # Script invariants
//!
//! Checked once, when the script is built:
//! - step names are unique and the initial step exists
//! - every step has a timeout branch
//! - labels are unique within a step (so every pattern has exactly one branch)
//! - every branch target exists

pub mod script;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::console::{ConsoleSession, ExpectSpec, MatchResult, Pattern};
use crate::error::{Error, Result};

pub use script::network_os_script;

/// Label under which the timeout branch is reported.
pub const TIMEOUT_LABEL: &str = "timeout";

// ============================================================================
// Script model
// ============================================================================

/// What to type when a branch is taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Nothing,
    Send(String),
    /// Sent like `Send` but masked in logs and transcripts.
    SendSecret(String),
}

/// Where a branch leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Step(String),
    /// Self-loop; counts towards the step's repeat limit.
    Stay,
    Installed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub action: Action,
    pub next: Next,
}

impl Branch {
    pub fn goto(step: &str) -> Self {
        Self {
            action: Action::Nothing,
            next: Next::Step(step.to_string()),
        }
    }

    pub fn stay() -> Self {
        Self {
            action: Action::Nothing,
            next: Next::Stay,
        }
    }

    pub fn installed() -> Self {
        Self {
            action: Action::Nothing,
            next: Next::Installed,
        }
    }

    pub fn fail(reason: &str) -> Self {
        Self {
            action: Action::Nothing,
            next: Next::Failed(reason.to_string()),
        }
    }

    pub fn send(mut self, text: &str) -> Self {
        self.action = Action::Send(text.to_string());
        self
    }

    pub fn secret(mut self, text: &str) -> Self {
        self.action = Action::SendSecret(text.to_string());
        self
    }

    /// Press enter.
    pub fn enter(self) -> Self {
        self.send("")
    }
}

/// One node of the install graph.
#[derive(Debug, Clone)]
pub struct InstallStep {
    name: String,
    timeout: Duration,
    expect: ExpectSpec,
    branches: HashMap<String, Branch>,
    duplicates: Vec<String>,
    on_timeout: Option<Branch>,
    repeat_limit: Option<u32>,
}

impl InstallStep {
    pub fn new(name: &str, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            timeout,
            expect: ExpectSpec::new(timeout),
            branches: HashMap::new(),
            duplicates: Vec::new(),
            on_timeout: None,
            repeat_limit: None,
        }
    }

    /// Register a pattern and the branch taken when it matches first.
    /// Registration order is the tie-break order, most specific first.
    pub fn on(mut self, label: &str, pattern: Pattern, branch: Branch) -> Self {
        if self.branches.insert(label.to_string(), branch).is_some() {
            self.duplicates.push(label.to_string());
        }
        self.expect = self.expect.with(label, pattern);
        self
    }

    pub fn on_timeout(mut self, branch: Branch) -> Self {
        self.on_timeout = Some(branch);
        self
    }

    pub fn repeat_limit(mut self, limit: u32) -> Self {
        self.repeat_limit = Some(limit);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn branch(&self, label: &str) -> Option<&Branch> {
        if label == TIMEOUT_LABEL {
            return self.on_timeout.as_ref();
        }
        self.branches.get(label)
    }

    fn all_branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values().chain(self.on_timeout.iter())
    }
}

/// Validated install graph.
#[derive(Debug, Clone)]
pub struct InstallScript {
    initial: String,
    steps: HashMap<String, InstallStep>,
}

impl InstallScript {
    pub fn new(initial: &str, steps: Vec<InstallStep>) -> Result<Self> {
        let mut by_name = HashMap::new();
        for step in steps {
            if step.name.is_empty() {
                return Err(Error::InvalidScript("step with empty name".into()));
            }
            if step.on_timeout.is_none() {
                return Err(Error::InvalidScript(format!(
                    "step '{}' has no timeout branch",
                    step.name
                )));
            }
            if let Some(label) = step.duplicates.first() {
                return Err(Error::InvalidScript(format!(
                    "step '{}' registers label '{}' twice",
                    step.name, label
                )));
            }
            if step.branches.contains_key(TIMEOUT_LABEL) {
                return Err(Error::InvalidScript(format!(
                    "step '{}' uses reserved label '{}'",
                    step.name, TIMEOUT_LABEL
                )));
            }
            if step.repeat_limit == Some(0) {
                return Err(Error::InvalidScript(format!(
                    "step '{}' has a repeat limit of zero",
                    step.name
                )));
            }
            let name = step.name.clone();
            if by_name.insert(name.clone(), step).is_some() {
                return Err(Error::InvalidScript(format!("duplicate step '{}'", name)));
            }
        }

        if !by_name.contains_key(initial) {
            return Err(Error::InvalidScript(format!(
                "initial step '{}' does not exist",
                initial
            )));
        }

        for step in by_name.values() {
            for branch in step.all_branches() {
                if let Next::Step(target) = &branch.next {
                    if !by_name.contains_key(target) {
                        return Err(Error::InvalidScript(format!(
                            "step '{}' branches to unknown step '{}'",
                            step.name, target
                        )));
                    }
                }
            }
        }

        Ok(Self {
            initial: initial.to_string(),
            steps: by_name,
        })
    }

    pub fn initial(&self) -> &str {
        &self.initial
    }

    pub fn step(&self, name: &str) -> Option<&InstallStep> {
        self.steps.get(name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// ============================================================================
// Director
// ============================================================================

/// What a successful install looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// Steps entered, in order. Self-loops are not repeated.
    pub path: Vec<String>,
    pub sends: usize,
    pub elapsed: Duration,
}

/// Drives one install script over one console session.
pub struct Director<'a> {
    session: &'a mut ConsoleSession,
    script: &'a InstallScript,
    deadline: Duration,
}

impl<'a> Director<'a> {
    pub fn new(session: &'a mut ConsoleSession, script: &'a InstallScript) -> Self {
        Self {
            session,
            script,
            deadline: Duration::from_secs(1800),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Run until `installed` or a failure.
    ///
    /// Errors: `InstallFailed` for failure branches and exhausted repeat
    /// limits, `PatternTimeout` for a timeout branch that fails or the
    /// overall deadline, `Channel` when the console goes away, `Cancelled`.
    pub fn run(&mut self) -> Result<InstallReport> {
        let start = Instant::now();
        let mut step = self.lookup(self.script.initial())?;
        let mut path = vec![step.name.clone()];
        let mut repeats = 0u32;
        let mut sends = 0usize;

        tracing::info!(step = %step.name, "install started");

        loop {
            let remaining = self.deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(self.deadline_error(step));
            }

            let spec = step.expect.retimed(step.timeout.min(remaining));
            let (label, trigger) = match self.session.expect(&spec)? {
                MatchResult::Matched { label, matched, .. } => (label, matched),
                MatchResult::Timeout => {
                    if start.elapsed() >= self.deadline {
                        return Err(self.deadline_error(step));
                    }
                    (TIMEOUT_LABEL.to_string(), String::new())
                }
                MatchResult::Closed => {
                    return Err(Error::Channel(format!(
                        "console closed during install step '{}'",
                        step.name
                    )))
                }
            };

            let branch = step.branch(&label).ok_or_else(|| {
                Error::InvalidScript(format!("step '{}' has no branch for '{}'", step.name, label))
            })?;
            tracing::debug!(step = %step.name, label = %label, next = ?branch.next, "branch");

            if branch.next == Next::Stay {
                repeats += 1;
                if let Some(limit) = step.repeat_limit {
                    if repeats >= limit {
                        return Err(Error::InstallFailed {
                            step: step.name.clone(),
                            reason: format!(
                                "'{}' repeated {} times in a row (limit {})",
                                label, repeats, limit
                            ),
                        });
                    }
                }
            } else {
                repeats = 0;
            }

            match &branch.action {
                Action::Nothing => {}
                Action::Send(text) => {
                    self.session.send(text)?;
                    sends += 1;
                }
                Action::SendSecret(text) => {
                    self.session.send_secret(text)?;
                    sends += 1;
                }
            }

            match &branch.next {
                Next::Stay => {}
                Next::Step(target) => {
                    step = self.lookup(target)?;
                    path.push(step.name.clone());
                    tracing::info!(step = %step.name, "install step");
                }
                Next::Installed => {
                    let elapsed = start.elapsed();
                    tracing::info!(?elapsed, sends, "installed");
                    return Ok(InstallReport {
                        path,
                        sends,
                        elapsed,
                    });
                }
                Next::Failed(reason) => {
                    if label == TIMEOUT_LABEL {
                        return Err(Error::PatternTimeout {
                            context: format!("{} (step '{}')", reason, step.name),
                            waited: spec.timeout(),
                        });
                    }
                    return Err(Error::InstallFailed {
                        step: step.name.clone(),
                        reason: format!("{}: {}", reason, trigger.trim()),
                    });
                }
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<&'a InstallStep> {
        let script: &'a InstallScript = self.script;
        script
            .step(name)
            .ok_or_else(|| Error::InvalidScript(format!("unknown step '{}'", name)))
    }

    fn deadline_error(&self, step: &InstallStep) -> Error {
        Error::PatternTimeout {
            context: format!("installing (stuck in step '{}')", step.name),
            waited: self.deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::console::testing::ScriptedChannel;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn boot_script(limit: u32) -> InstallScript {
        InstallScript::new(
            "boot",
            vec![
                InstallStep::new("boot", secs(2))
                    .on(
                        "booting",
                        Pattern::literal("still booting"),
                        Branch::stay().enter(),
                    )
                    .on(
                        "ready",
                        Pattern::literal("Username:"),
                        Branch::goto("login").send("vagrant"),
                    )
                    .on_timeout(Branch::fail("no boot output"))
                    .repeat_limit(limit),
                InstallStep::new("login", secs(2))
                    .on(
                        "password",
                        Pattern::literal("Password:"),
                        Branch::installed().secret("vagrant"),
                    )
                    .on_timeout(Branch::fail("no password prompt")),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_happy_path_sends_in_order() {
        let script = boot_script(5);
        let channel = ScriptedChannel::new()
            .chunk("still booting\r\n")
            .chunk("Username: ")
            .chunk("Password: ");
        let probe = channel.probe();
        let mut session = ConsoleSession::new(Box::new(channel), CancelToken::new());

        let report = Director::new(&mut session, &script).run().unwrap();

        assert_eq!(report.path, vec!["boot", "login"]);
        assert_eq!(report.sends, 3);
        assert_eq!(probe.sends(), vec!["", "vagrant", "vagrant"]);
    }

    #[test]
    fn test_self_loop_limit_fails_install() {
        let script = boot_script(3);
        let mut channel = ScriptedChannel::new();
        for _ in 0..10 {
            channel = channel.chunk("still booting\r\n");
        }
        let probe = channel.probe();
        let mut session = ConsoleSession::new(Box::new(channel), CancelToken::new());

        match Director::new(&mut session, &script).run() {
            Err(Error::InstallFailed { step, reason }) => {
                assert_eq!(step, "boot");
                assert!(reason.contains("3 times"), "{}", reason);
            }
            other => panic!("unexpected {:?}", other),
        }
        // the third repeat fails before its enter is sent
        assert_eq!(probe.sends().len(), 2);
    }

    #[test]
    fn test_leaving_a_step_resets_repeats() {
        let script = InstallScript::new(
            "a",
            vec![
                InstallStep::new("a", secs(2))
                    .on("noise", Pattern::literal("noise"), Branch::stay())
                    .on("next", Pattern::literal("next"), Branch::goto("b"))
                    .on_timeout(Branch::fail("stuck"))
                    .repeat_limit(2),
                InstallStep::new("b", secs(2))
                    .on("back", Pattern::literal("back"), Branch::goto("a"))
                    .on("done", Pattern::literal("done"), Branch::installed())
                    .on_timeout(Branch::fail("stuck")),
            ],
        )
        .unwrap();
        let channel = ScriptedChannel::new()
            .chunk("noise next back noise next done");
        let mut session = ConsoleSession::new(Box::new(channel), CancelToken::new());

        let report = Director::new(&mut session, &script).run().unwrap();
        assert_eq!(report.path, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_failing_timeout_branch_is_pattern_timeout() {
        let script = InstallScript::new(
            "wait",
            vec![InstallStep::new("wait", Duration::from_millis(150))
                .on("never", Pattern::literal("never"), Branch::installed())
                .on_timeout(Branch::fail("no console output"))],
        )
        .unwrap();
        let mut session = ConsoleSession::new(Box::new(ScriptedChannel::new()), CancelToken::new());

        let err = Director::new(&mut session, &script).run().unwrap_err();
        assert_eq!(err.kind(), "pattern-timeout");
        assert!(err.to_string().contains("no console output"));
    }

    #[test]
    fn test_overall_deadline_bounds_self_loops() {
        let script = InstallScript::new(
            "wait",
            vec![InstallStep::new("wait", Duration::from_millis(100))
                .on("never", Pattern::literal("never"), Branch::installed())
                .on_timeout(Branch::stay().enter())],
        )
        .unwrap();
        let mut session = ConsoleSession::new(Box::new(ScriptedChannel::new()), CancelToken::new());

        let start = Instant::now();
        let err = Director::new(&mut session, &script)
            .with_deadline(Duration::from_millis(450))
            .run()
            .unwrap_err();
        assert_eq!(err.kind(), "pattern-timeout");
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_failure_branch_carries_trigger_text() {
        let script = InstallScript::new(
            "boot",
            vec![InstallStep::new("boot", secs(2))
                .on(
                    "panic",
                    Pattern::regex(r"Kernel panic[^\r\n]*").unwrap(),
                    Branch::fail("guest crashed"),
                )
                .on_timeout(Branch::fail("silent"))],
        )
        .unwrap();
        let channel = ScriptedChannel::new().chunk("Kernel panic - not syncing: VFS\r\n");
        let mut session = ConsoleSession::new(Box::new(channel), CancelToken::new());

        match Director::new(&mut session, &script).run() {
            Err(Error::InstallFailed { reason, .. }) => {
                assert!(reason.contains("guest crashed"));
                assert!(reason.contains("not syncing"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_closed_console_is_channel_error() {
        let script = boot_script(3);
        let channel = ScriptedChannel::new().hang_up();
        let mut session = ConsoleSession::new(Box::new(channel), CancelToken::new());
        let err = Director::new(&mut session, &script).run().unwrap_err();
        assert_eq!(err.kind(), "channel");
    }

    #[test]
    fn test_script_requires_timeout_branch() {
        let err = InstallScript::new(
            "a",
            vec![InstallStep::new("a", secs(1)).on("x", Pattern::literal("x"), Branch::installed())],
        )
        .unwrap_err();
        assert!(err.to_string().contains("no timeout branch"));
    }

    #[test]
    fn test_script_rejects_unknown_target() {
        let err = InstallScript::new(
            "a",
            vec![InstallStep::new("a", secs(1))
                .on("x", Pattern::literal("x"), Branch::goto("nowhere"))
                .on_timeout(Branch::stay())],
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown step 'nowhere'"));
    }

    #[test]
    fn test_script_rejects_duplicate_label() {
        let err = InstallScript::new(
            "a",
            vec![InstallStep::new("a", secs(1))
                .on("x", Pattern::literal("x"), Branch::installed())
                .on("x", Pattern::literal("y"), Branch::stay())
                .on_timeout(Branch::stay())],
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid-script");
    }

    #[test]
    fn test_script_rejects_missing_initial_step() {
        let err = InstallScript::new(
            "start",
            vec![InstallStep::new("a", secs(1)).on_timeout(Branch::installed())],
        )
        .unwrap_err();
        assert!(err.to_string().contains("initial step 'start'"));
    }
}
