//! Configuration applier.
//!
//! Pushes a [`ConfigurationPayload`] into a freshly installed guest through
//! its console and confirms the configuration engine accepted it:
//!
//! 1. clear stale log and payload files
//! 2. write the payload to a guest file
//! 3. run the engine's apply command with the whole payload, repeatedly
//!    while it reports "still converging" or "lock not acquired"
//! 4. when the engine entered exclusive mode, read its failure listing:
//!    no error entries means applied-with-warnings, any entry means failed
//! 5. otherwise a zero exit status means applied-clean
//!
//! Contention is polled at a fixed delay under an overall deadline; see
//! [`ContentionPolling`].

pub mod recipe;

use std::path::Path;
use std::time::{Duration, Instant};

use crate::console::ConsoleSession;
use crate::error::{Error, Result};
use crate::retry::{ContentionPolling, Disposition, Observation, RetryPolicy};

pub use recipe::{ApplyRecipe, Attempt, ImageFeatures};

/// Management interface brought up by the default payload.
pub const MGMT_INTERFACE: &str = "MgmtEth0/RP0/CPU0/0";
/// Host side of the hypervisor NAT network.
pub const NAT_GATEWAY: &str = "10.0.2.2";
pub const GRPC_PORT: u16 = 57777;

/// Ordered configuration commands, opaque to the applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationPayload {
    commands: Vec<String>,
}

impl ConfigurationPayload {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }

    /// One command per line. Blank lines and `#` comments are skipped;
    /// indentation is kept since it selects configuration sub-modes.
    pub fn parse(text: &str) -> Result<Self> {
        let commands: Vec<String> = text
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
            .map(str::to_string)
            .collect();
        if commands.is_empty() {
            return Err(Error::Config("configuration payload is empty".into()));
        }
        Ok(Self { commands })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    /// Management bring-up: DHCP on the management port, app traffic
    /// sourced from it, default route via the NAT gateway, telnet, and SSH
    /// and gRPC when the image carries them.
    pub fn management_defaults(features: ImageFeatures) -> Self {
        let mut commands = vec![
            "telnet vrf default ipv4 server max-servers 10".to_string(),
            format!("interface {}", MGMT_INTERFACE),
            " ipv4 address dhcp".to_string(),
            " no shutdown".to_string(),
            "!".to_string(),
            format!("tpa address-family ipv4 update-source {}", MGMT_INTERFACE),
            format!(
                "router static address-family ipv4 unicast 0.0.0.0/0 {} {}",
                MGMT_INTERFACE, NAT_GATEWAY
            ),
        ];
        if features.crypto {
            commands.push("ssh server v2".into());
            commands.push("ssh server vrf default".into());
        }
        if features.mgbl {
            commands.push("grpc".into());
            commands.push(format!(" port {}", GRPC_PORT));
            commands.push("!".into());
        }
        Self { commands }
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn render(&self) -> String {
        let mut text = self.commands.join("\n");
        text.push('\n');
        text
    }
}

/// Final verdict of the configuration engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplicationOutcome {
    AppliedClean,
    AppliedWithWarnings { detail: String },
    Failed { reason: String },
}

impl ApplicationOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub outcome: ApplicationOutcome,
    /// Apply command invocations.
    pub attempts: u32,
    /// Contention retries among them.
    pub retries: u32,
    pub elapsed: Duration,
}

/// Drives one payload into one guest.
pub struct Applier<'a> {
    session: &'a mut ConsoleSession,
    recipe: &'a ApplyRecipe,
    retry_delay: Duration,
    deadline: Duration,
    command_timeout: Duration,
}

impl<'a> Applier<'a> {
    pub fn new(session: &'a mut ConsoleSession, recipe: &'a ApplyRecipe) -> Self {
        Self {
            session,
            recipe,
            retry_delay: Duration::from_secs(5),
            deadline: Duration::from_secs(900),
            command_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_retry(mut self, delay: Duration, deadline: Duration) -> Self {
        self.retry_delay = delay;
        self.deadline = deadline;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Apply `payload` and report how the engine took it.
    ///
    /// A rejected configuration is an `Ok` outcome. Errors are reserved for
    /// the console (`Channel`, `PatternTimeout`), the contention deadline
    /// (`TransientContention`), failing housekeeping commands and
    /// cancellation.
    pub fn apply(&mut self, payload: &ConfigurationPayload) -> Result<ApplyReport> {
        let start = Instant::now();
        let housekeeping = self.command_timeout;

        self.session.exec_ok(&self.recipe.clear_command(), housekeeping)?;
        for cmd in &self.recipe.prepare_commands {
            self.session.exec_ok(cmd, housekeeping)?;
        }
        self.session
            .write_file(self.recipe.payload_path(), &payload.render())?;
        tracing::info!(commands = payload.commands().len(), "payload written");

        let mut policy = ContentionPolling::new(self.retry_delay, self.deadline);
        let mut attempts = 0u32;

        let outcome = loop {
            let remaining = self.deadline.saturating_sub(policy.elapsed());
            if remaining.is_zero() {
                return Err(Error::TransientContention(format!(
                    "deadline of {:?} exceeded after {} attempts",
                    self.deadline, attempts
                )));
            }

            let timeout = self.command_timeout.min(remaining);
            let result = self.session.exec(&self.recipe.apply_command(), timeout)?;
            attempts += 1;
            if !result.completed {
                return Err(Error::PatternTimeout {
                    context: "applying configuration".into(),
                    waited: timeout,
                });
            }

            let observation = match self.recipe.classify(&result) {
                Attempt::Clean => break ApplicationOutcome::AppliedClean,
                Attempt::Exclusive(notice) => break self.inspect(&notice)?,
                Attempt::Failed(output) => break ApplicationOutcome::Failed { reason: output },
                Attempt::Converging(marker) => Observation::Converging(marker),
                Attempt::Contended(marker) => Observation::Contended(marker),
            };

            match policy.classify(&observation) {
                Disposition::Retry(delay) => {
                    tracing::info!(attempt = attempts, ?delay, "configuration engine busy: {:?}", observation);
                    self.session.cancel_token().sleep(delay)?;
                }
                Disposition::Fatal(reason) => {
                    tracing::error!(attempts, "giving up on contended configuration engine");
                    return Err(Error::TransientContention(reason));
                }
                Disposition::Success => break ApplicationOutcome::AppliedClean,
            }
        };

        if outcome.is_applied() {
            for cmd in &self.recipe.finish_commands {
                self.session.exec_ok(cmd, housekeeping)?;
            }
        }

        let report = ApplyReport {
            outcome,
            attempts,
            retries: policy.state().retries,
            elapsed: start.elapsed(),
        };
        tracing::info!(outcome = ?report.outcome, attempts, retries = report.retries, "configuration applied");
        Ok(report)
    }

    fn inspect(&mut self, notice: &str) -> Result<ApplicationOutcome> {
        let listing = self
            .session
            .exec_ok(&self.recipe.inspect_command(), self.command_timeout)?;
        let entries = self.recipe.error_entries(&listing);
        if entries.is_empty() {
            let detail = if listing.trim().is_empty() {
                notice.to_string()
            } else {
                format!("{}\n{}", notice, listing.trim())
            };
            return Ok(ApplicationOutcome::AppliedWithWarnings { detail });
        }
        Ok(ApplicationOutcome::Failed {
            reason: entries.join("\n"),
        })
    }
}
