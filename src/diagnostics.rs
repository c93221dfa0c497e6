//! Diagnostic bundle written on every fatal outcome.
//!
//! Layout under the output directory:
//!
//! ```text
//! <dir>/<node>/transcript.log     ANSI-stripped console transcript
//! <dir>/<node>/diagnostics.json   phase, error, triggering text, transcript tail
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Lines of transcript copied into the JSON summary.
pub const TAIL_LINES: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticBundle {
    pub node: String,
    pub phase: String,
    pub error_kind: String,
    pub error: String,
    /// Console text that triggered the failure, when there was one.
    pub trigger: Option<String>,
    pub transcript_tail: Vec<String>,
    #[serde(skip)]
    pub transcript: String,
}

impl DiagnosticBundle {
    pub fn new(node: &str, phase: &str, error: &Error, transcript: String) -> Self {
        let lines: Vec<&str> = transcript.lines().collect();
        let tail = lines[lines.len().saturating_sub(TAIL_LINES)..]
            .iter()
            .map(|l| l.to_string())
            .collect();
        Self {
            node: node.to_string(),
            phase: phase.to_string(),
            error_kind: error.kind().to_string(),
            error: error.to_string(),
            trigger: trigger_text(error),
            transcript_tail: tail,
            transcript,
        }
    }

    /// Write the bundle; returns the node's bundle directory.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let node_dir = dir.join(&self.node);
        std::fs::create_dir_all(&node_dir)?;
        std::fs::write(node_dir.join("transcript.log"), &self.transcript)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("serializing diagnostics: {}", e)))?;
        std::fs::write(node_dir.join("diagnostics.json"), json)?;
        tracing::info!(node = %self.node, dir = %node_dir.display(), "diagnostic bundle written");
        Ok(node_dir)
    }
}

fn trigger_text(error: &Error) -> Option<String> {
    match error {
        Error::ConfigurationFailed(text) => Some(text.clone()),
        Error::InstallFailed { reason, .. } => Some(reason.clone()),
        Error::CommandFailed { output, .. } => Some(output.clone()),
        Error::TransientContention(text) => Some(text.clone()),
        _ => None,
    }
}
