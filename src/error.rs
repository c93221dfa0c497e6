//! Error taxonomy for console-driven builds.
//!
//! The matcher and the session only ever report outcomes. Deciding whether an
//! outcome is fatal belongs to the retry policies and the two state machines
//! (install director, configuration applier), which turn outcomes into these
//! errors.

use std::time::Duration;

/// Result type alias for iso2box operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Console connection lost or unusable. Always fatal to the current phase.
    #[error("console channel error: {0}")]
    Channel(String),

    /// No expected output within the deadline and no branch to absorb it.
    #[error("no expected output while {context} (waited {waited:?})")]
    PatternTimeout { context: String, waited: Duration },

    /// Configuration engine busy or locked. Retried by the applier, only
    /// surfaced when the overall deadline runs out.
    #[error("configuration engine contended: {0}")]
    TransientContention(String),

    /// The configuration engine reported explicit error entries.
    #[error("configuration failed:\n{0}")]
    ConfigurationFailed(String),

    /// Post-configuration probe never became healthy.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Install script graph violates its exhaustiveness invariant.
    #[error("invalid install script: {0}")]
    InvalidScript(String),

    /// A guest shell command run through the console exited non-zero.
    #[error("command failed (exit {exit_code}): {command}\noutput: {output}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        output: String,
    },

    /// The install reached its terminal failure state.
    #[error("install failed in step '{step}': {reason}")]
    InstallFailed { step: String, reason: String },

    /// Operator abort observed while waiting.
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short phase-independent tag used in diagnostic bundles.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Channel(_) => "channel",
            Self::PatternTimeout { .. } => "pattern-timeout",
            Self::TransientContention(_) => "transient-contention",
            Self::ConfigurationFailed(_) => "configuration-failed",
            Self::ValidationFailed(_) => "validation-failed",
            Self::InvalidScript(_) => "invalid-script",
            Self::CommandFailed { .. } => "command-failed",
            Self::InstallFailed { .. } => "install-failed",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_failure_keeps_diagnostic_verbatim() {
        let err = Error::ConfigurationFailed("!! % Invalid input detected at '^' marker.".into());
        assert!(err.to_string().contains("% Invalid input detected at '^' marker."));
        assert_eq!(err.kind(), "configuration-failed");
    }

    #[test]
    fn test_io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io.into();
        assert_eq!(err.kind(), "io");
    }
}
