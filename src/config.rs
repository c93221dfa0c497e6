//! Build configuration.
//!
//! Loaded from an optional TOML file. Every field has a default, so an empty
//! file (or no file at all) yields a working configuration for IOS XR images.
//! Durations are plain integers with their unit in the field name.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Everything a build needs besides the image and the topology.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub credentials: Credentials,
    pub console: ConsoleConfig,
    pub install: InstallConfig,
    pub apply: ApplyConfig,
    pub setup: SetupConfig,
    pub validate: ValidateConfig,
    pub output: OutputConfig,
}

impl BuildConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Account created on first boot and used for every later login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: "vagrant".into(),
            password: "vagrant".into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<secret>")
            .finish()
    }
}

/// How to reach a node's serial console.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Host where the hypervisor exposes UART TCP servers.
    pub host: String,
    /// Helper command used instead of a direct TCP connection, e.g.
    /// `["socat", "TCP:{host}:{port}", "-,raw,echo=0,escape=0x1d"]`.
    pub helper: Option<Vec<String>>,
    pub connect_attempts: u32,
    pub connect_backoff_ms: u64,
    pub connect_max_backoff_ms: u64,
    pub connect_max_elapsed_secs: u64,
    pub default_timeout_secs: u64,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            helper: None,
            connect_attempts: 30,
            connect_backoff_ms: 500,
            connect_max_backoff_ms: 5_000,
            connect_max_elapsed_secs: 120,
            default_timeout_secs: 30,
        }
    }
}

impl ConsoleConfig {
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn connect_max_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_max_backoff_ms)
    }

    pub fn connect_max_elapsed(&self) -> Duration {
        Duration::from_secs(self.connect_max_elapsed_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// First-boot install driving.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Wait for the very first console output after power-on.
    pub boot_timeout_secs: u64,
    /// Silence tolerated in interactive steps before pressing enter.
    pub step_timeout_secs: u64,
    /// Wall-clock cap for the whole install.
    pub deadline_secs: u64,
    /// Consecutive self-loops tolerated in one step.
    pub repeat_limit: u32,
    /// Exec-mode prompt.
    pub prompt_regex: String,
    /// Configuration-mode prompt left over from an earlier session.
    pub config_prompt_regex: String,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            boot_timeout_secs: 1200,
            step_timeout_secs: 10,
            deadline_secs: 1800,
            repeat_limit: 90,
            prompt_regex: r"RP/\d+/RP\d+/CPU\d+:[\w.-]+#|\bios#".into(),
            config_prompt_regex: r"ios.config.*#".into(),
        }
    }
}

impl InstallConfig {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

/// Configuration application recipe and its retry bounds.
///
/// Commands run in the guest shell. `{payload}` and `{log}` are replaced
/// with `payload_path` and `log_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    pub retry_delay_secs: u64,
    pub deadline_secs: u64,
    pub command_timeout_secs: u64,
    /// Prefix that hands a CLI line to the guest shell.
    pub shell_prefix: String,
    pub payload_path: String,
    pub log_path: String,
    pub apply_command: String,
    /// Lists configuration items the engine rejected.
    pub inspect_command: String,
    pub converging_pattern: String,
    pub contended_pattern: String,
    pub exclusive_pattern: String,
    /// One match per error entry in the inspection listing.
    pub error_entry_pattern: String,
    /// Run before the payload is applied.
    pub prepare_commands: Vec<String>,
    /// Run after the payload is applied.
    pub finish_commands: Vec<String>,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: 5,
            deadline_secs: 900,
            command_timeout_secs: 300,
            shell_prefix: "run ".into(),
            payload_path: "/tmp/iso2box-payload.cfg".into(),
            log_path: "/tmp/iso2box-apply.log".into(),
            apply_command: "source /pkg/bin/ztp_helper.sh && xrapply {payload}".into(),
            inspect_command: "source /pkg/bin/ztp_helper.sh && xrcmd \"show configuration failed\""
                .into(),
            converging_pattern: r"(?i)configuration (is )?still in progress".into(),
            contended_pattern: r"(?i)lock not acquired".into(),
            exclusive_pattern: r"(?i)entered exclusive.*successfully".into(),
            error_entry_pattern: r"(?m)^!!%.*$".into(),
            prepare_commands: vec![
                "mkdir -p /disk0:/ztp/state".into(),
                "touch /disk0:/ztp/state/state_is_complete".into(),
            ],
            finish_commands: vec![
                "echo 'nameserver 208.67.222.222' >> /etc/resolv.conf".into(),
                "echo 'nameserver 208.67.220.220' >> /etc/resolv.conf".into(),
            ],
        }
    }
}

impl ApplyConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Vagrant insecure public key, replaced by `vagrant up` on first use.
pub const VAGRANT_INSECURE_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAABIwAAAQEA6NF8iallvQVp22WDkTkyrtvp9eWW6A8YVr+kz4TjGYe7gHzIw+niNltGEFHzD8+v1I2YJ6oXevct1YeS0o9HZyN1Q9qgCgzUFtdOKLv6IedplqoPkcmF0aYet2PkEDo3MlTBckFXPITAMzF8dJSIFo9D8HfdOV0IAdx4O7PtixWKn5y2hMNG0zQPyUecp4pzC6kivAIhyfHilFR61RGL+GPXQ2MWZWFYbAGjyiYJnAmCP3NOTd0jMZEnDkbUvxhMmBYSdETk1rRgm+R4LOzFUGaHqHDLKLX+FIPKcF96hrucXzcWyLbIbEgE98OHlnVYCzRdK8jlqm8tehUc9c9WhQ== vagrant insecure public key";

/// Guest preparation around the configuration payload: CLI housekeeping
/// before it, Vagrant access and SSH host keys after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    /// CLI commands run at the prompt before the payload is applied.
    pub cli_commands: Vec<String>,
    /// Shell entry for the host namespace, where sshd and sudo live.
    pub shell_prefix: String,
    pub command_timeout_secs: u64,
    pub permit_root_login: bool,
    pub passwordless_sudo: bool,
    /// Installed for the login user; empty skips key setup.
    pub authorized_key: String,
    /// Service started for shell access to the app-hosting namespace;
    /// empty skips it.
    pub service: String,
    /// Printed by `service <name> status` once it is up.
    pub service_ready: String,
    pub service_poll_secs: u64,
    pub service_deadline_secs: u64,
    /// RSA host key size on crypto images; 0 skips key generation.
    pub crypto_key_bits: u32,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            cli_commands: vec!["ztp terminate noprompt".into()],
            shell_prefix: "bash -c ".into(),
            command_timeout_secs: 60,
            permit_root_login: true,
            passwordless_sudo: true,
            authorized_key: VAGRANT_INSECURE_KEY.into(),
            service: "sshd_operns".into(),
            service_ready: "is running...".into(),
            service_poll_secs: 5,
            service_deadline_secs: 300,
            crypto_key_bits: 2048,
        }
    }
}

impl SetupConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn service_poll(&self) -> Duration {
        Duration::from_secs(self.service_poll_secs)
    }

    pub fn service_deadline(&self) -> Duration {
        Duration::from_secs(self.service_deadline_secs)
    }
}

/// Management-path liveness probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidateConfig {
    pub host: String,
    /// Greeting expected from the management service.
    pub banner: String,
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_elapsed_secs: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ValidateConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            banner: "SSH-".into(),
            attempts: 12,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 15_000,
            max_elapsed_secs: 180,
            connect_timeout_ms: 3_000,
        }
    }
}

impl ValidateConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_secs(self.max_elapsed_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Per-node diagnostic bundles land in `<diagnostics_dir>/<node>/`.
    pub diagnostics_dir: PathBuf,
    /// VirtualBox base folder for build VMs and produced boxes.
    pub machines_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            diagnostics_dir: PathBuf::from("diagnostics"),
            machines_dir: PathBuf::from("machines"),
        }
    }
}
