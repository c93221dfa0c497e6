//! Per-node build flow and concurrent multi-node runs.
//!
//! For each node: connect to its console, drive the install script, apply
//! the configuration payload around the guest setup steps, close the
//! console, then validate the management path. Nodes run on their own scoped threads with fully
//! independent sessions, matchers and retry state.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;

use crate::apply::{Applier, ApplicationOutcome, ApplyRecipe, ConfigurationPayload, ImageFeatures};
use crate::cancel::CancelToken;
use crate::config::{BuildConfig, ConsoleConfig, ValidateConfig};
use crate::console::{ChildChannel, ConsoleChannel, ConsoleSession, TcpChannel};
use crate::diagnostics::DiagnosticBundle;
use crate::error::{Error, Result};
use crate::install::{network_os_script, Director, InstallScript};
use crate::retry::BoundedExponential;
use crate::setup::GuestSetup;
use crate::topology::{Node, Topology};
use crate::validate::{Health, Probe, TcpProbe, Validator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Connect,
    Install,
    Configure,
    Setup,
    Validate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Install => "install",
            Self::Configure => "configure",
            Self::Setup => "setup",
            Self::Validate => "validate",
        };
        f.write_str(name)
    }
}

/// How the pipeline reaches a node's console and management path.
pub trait GuestAccess: Sync {
    fn console(&self, node: &Node, cancel: &CancelToken) -> Result<Box<dyn ConsoleChannel>>;

    fn management_probe(&self, node: &Node) -> Box<dyn Probe + Send>;
}

/// Consoles exposed as local TCP servers by the hypervisor, management
/// reached through a forwarded host port.
pub struct LocalGuests {
    console: ConsoleConfig,
    validate: ValidateConfig,
}

impl LocalGuests {
    pub fn new(config: &BuildConfig) -> Self {
        Self {
            console: config.console.clone(),
            validate: config.validate.clone(),
        }
    }
}

impl GuestAccess for LocalGuests {
    fn console(&self, node: &Node, cancel: &CancelToken) -> Result<Box<dyn ConsoleChannel>> {
        if let Some(helper) = &self.console.helper {
            let port = node.console_port.to_string();
            let args: Vec<String> = helper
                .iter()
                .map(|a| a.replace("{host}", &self.console.host).replace("{port}", &port))
                .collect();
            let (program, rest) = args
                .split_first()
                .ok_or_else(|| Error::Config("console.helper is empty".into()))?;
            let mut cmd = Command::new(program);
            cmd.args(rest);
            return Ok(Box::new(ChildChannel::spawn(cmd)?));
        }

        let mut policy = BoundedExponential::new(
            self.console.connect_attempts,
            self.console.connect_backoff(),
            self.console.connect_max_backoff(),
            self.console.connect_max_elapsed(),
        );
        let channel =
            TcpChannel::connect_with_retry(&self.console.host, node.console_port, &mut policy, cancel)?;
        Ok(Box::new(channel))
    }

    fn management_probe(&self, node: &Node) -> Box<dyn Probe + Send> {
        Box::new(TcpProbe::new(
            &self.validate.host,
            node.management_port,
            &self.validate.banner,
            self.validate.connect_timeout(),
        ))
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub skip_validation: bool,
    /// `None` applies the management defaults for the detected image features.
    pub payload: Option<ConfigurationPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "kebab-case")]
pub enum Verdict {
    Healthy,
    /// Built and configured, validation skipped on request.
    Skipped,
    /// Built and configured, but the management path never came up.
    Unhealthy { reason: String },
    Failed { phase: String, error: String },
}

impl Verdict {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Healthy | Self::Skipped)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node: String,
    pub verdict: Verdict,
    pub install_path: Vec<String>,
    pub apply_attempts: u32,
    pub apply_retries: u32,
    /// Detail of an applied-with-warnings outcome.
    pub warnings: Option<String>,
    pub validation_attempts: u32,
    pub elapsed_secs: f64,
    pub diagnostics: Option<PathBuf>,
}

impl NodeReport {
    fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            verdict: Verdict::Failed {
                phase: Phase::Connect.to_string(),
                error: "not started".into(),
            },
            install_path: Vec::new(),
            apply_attempts: 0,
            apply_retries: 0,
            warnings: None,
            validation_attempts: 0,
            elapsed_secs: 0.0,
            diagnostics: None,
        }
    }

    fn crashed(node: &str) -> Self {
        let mut report = Self::new(node);
        report.verdict = Verdict::Failed {
            phase: "driver".into(),
            error: "node driver panicked".into(),
        };
        report
    }
}

/// Everything shared read-only by all node drivers.
pub struct BuildPlan<'a> {
    pub config: &'a BuildConfig,
    pub script: InstallScript,
    pub recipe: ApplyRecipe,
    pub setup: GuestSetup,
    pub options: BuildOptions,
}

impl<'a> BuildPlan<'a> {
    pub fn new(config: &'a BuildConfig, options: BuildOptions) -> Result<Self> {
        Ok(Self {
            config,
            script: network_os_script(&config.credentials, &config.install)?,
            recipe: ApplyRecipe::from_config(&config.apply)?,
            setup: GuestSetup::new(&config.setup, &config.credentials, &config.install)?,
            options,
        })
    }
}

/// Build one node to a verdict. Never panics on guest misbehaviour; every
/// failure ends up in the report and, when fatal, in a diagnostic bundle.
pub fn build_node(
    node: &Node,
    plan: &BuildPlan<'_>,
    access: &dyn GuestAccess,
    cancel: &CancelToken,
) -> NodeReport {
    let span = tracing::info_span!("node", node = %node.name);
    let _enter = span.enter();
    let start = Instant::now();
    let mut report = NodeReport::new(&node.name);

    let channel = match access.console(node, cancel) {
        Ok(channel) => channel,
        Err(e) => {
            fail(&mut report, plan, Phase::Connect, &e, String::new());
            report.elapsed_secs = start.elapsed().as_secs_f64();
            return report;
        }
    };

    let mut session = ConsoleSession::new(channel, cancel.clone())
        .with_default_timeout(plan.config.console.default_timeout())
        .with_shell_prefix(&plan.config.apply.shell_prefix);

    let configured = configure(&mut session, plan, &mut report);
    let transcript = session.transcript();
    session.close();

    if let Err((phase, e)) = configured {
        fail(&mut report, plan, phase, &e, transcript);
        report.elapsed_secs = start.elapsed().as_secs_f64();
        return report;
    }

    report.verdict = if plan.options.skip_validation {
        tracing::info!("validation skipped");
        Verdict::Skipped
    } else {
        let mut probe = access.management_probe(node);
        match Validator::from_config(&plan.config.validate).run(probe.as_mut(), cancel) {
            Ok(validation) => {
                report.validation_attempts = validation.attempts;
                match validation.health {
                    Health::Healthy => Verdict::Healthy,
                    Health::Unhealthy(reason) => {
                        let error = Error::ValidationFailed(reason.clone());
                        report.diagnostics = write_bundle(plan, &node.name, Phase::Validate, &error, transcript);
                        Verdict::Unhealthy { reason }
                    }
                }
            }
            Err(e) => {
                fail(&mut report, plan, Phase::Validate, &e, transcript);
                report.verdict.clone()
            }
        }
    };

    report.elapsed_secs = start.elapsed().as_secs_f64();
    report
}

fn configure(
    session: &mut ConsoleSession,
    plan: &BuildPlan<'_>,
    report: &mut NodeReport,
) -> std::result::Result<(), (Phase, Error)> {
    let install = Director::new(session, &plan.script)
        .with_deadline(plan.config.install.deadline())
        .run()
        .map_err(|e| (Phase::Install, e))?;
    report.install_path = install.path;

    let features = ImageFeatures::detect(session, plan.config.apply.command_timeout())
        .map_err(|e| (Phase::Configure, e))?;
    let defaults;
    let payload = match &plan.options.payload {
        Some(payload) => payload,
        None => {
            defaults = ConfigurationPayload::management_defaults(features);
            &defaults
        }
    };

    plan.setup
        .before_payload(session)
        .map_err(|e| (Phase::Setup, e))?;

    let applied = Applier::new(session, &plan.recipe)
        .with_retry(plan.config.apply.retry_delay(), plan.config.apply.deadline())
        .with_command_timeout(plan.config.apply.command_timeout())
        .apply(payload)
        .map_err(|e| (Phase::Configure, e))?;
    report.apply_attempts = applied.attempts;
    report.apply_retries = applied.retries;

    match applied.outcome {
        ApplicationOutcome::AppliedClean => {}
        ApplicationOutcome::AppliedWithWarnings { detail } => {
            tracing::warn!("configuration applied with warnings: {}", detail);
            report.warnings = Some(detail);
        }
        ApplicationOutcome::Failed { reason } => {
            return Err((Phase::Configure, Error::ConfigurationFailed(reason)))
        }
    }

    plan.setup
        .after_payload(session, features)
        .map_err(|e| (Phase::Setup, e))
}

fn fail(report: &mut NodeReport, plan: &BuildPlan<'_>, phase: Phase, error: &Error, transcript: String) {
    tracing::error!(phase = %phase, kind = error.kind(), "{}", error);
    report.diagnostics = write_bundle(plan, &report.node, phase, error, transcript);
    report.verdict = Verdict::Failed {
        phase: phase.to_string(),
        error: error.to_string(),
    };
}

fn write_bundle(
    plan: &BuildPlan<'_>,
    node: &str,
    phase: Phase,
    error: &Error,
    transcript: String,
) -> Option<PathBuf> {
    let bundle = DiagnosticBundle::new(node, &phase.to_string(), error, transcript);
    match bundle.write(&plan.config.output.diagnostics_dir) {
        Ok(dir) => Some(dir),
        Err(e) => {
            tracing::error!("failed to write diagnostics for {}: {}", node, e);
            None
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub reports: Vec<NodeReport>,
}

impl RunSummary {
    pub fn passed(&self) -> bool {
        !self.reports.is_empty() && self.reports.iter().all(|r| r.verdict.is_success())
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            1
        }
    }
}

/// Build every node of `topology` concurrently.
pub fn run_topology(
    topology: &Topology,
    plan: &BuildPlan<'_>,
    access: &dyn GuestAccess,
    cancel: &CancelToken,
) -> Result<RunSummary> {
    topology.validate()?;
    tracing::info!(nodes = topology.nodes.len(), "starting build");

    let reports: Vec<NodeReport> = std::thread::scope(|scope| {
        let handles: Vec<_> = topology
            .nodes
            .iter()
            .map(|node| (node, scope.spawn(move || build_node(node, plan, access, cancel))))
            .collect();
        handles
            .into_iter()
            .map(|(node, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| NodeReport::crashed(&node.name))
            })
            .collect()
    });

    Ok(RunSummary { reports })
}
