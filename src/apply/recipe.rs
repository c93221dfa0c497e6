//! Guest-side commands and textual markers of the configuration engine.
//!
//! The applier never parses structured output. It only knows what to run
//! and which markers mean what, and all of that comes from here.

use regex::Regex;

use crate::config::ApplyConfig;
use crate::console::{CommandResult, ConsoleSession};
use crate::error::{Error, Result};

/// What one apply attempt looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// Exit status zero and no exclusive-mode notice.
    Clean,
    /// The engine entered exclusive mode; the failure listing decides.
    Exclusive(String),
    /// Earlier configuration still converging.
    Converging(String),
    /// Configuration lock held elsewhere.
    Contended(String),
    /// Anything else that did not succeed.
    Failed(String),
}

fn compile(name: &str, expr: &str) -> Result<Regex> {
    Regex::new(expr).map_err(|e| Error::Config(format!("apply.{}: {}", name, e)))
}

fn first_match(re: &Regex, text: &str) -> String {
    re.find(text)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// Compiled form of [`ApplyConfig`].
#[derive(Debug, Clone)]
pub struct ApplyRecipe {
    payload_path: String,
    log_path: String,
    apply_command: String,
    inspect_command: String,
    converging: Regex,
    contended: Regex,
    exclusive: Regex,
    error_entry: Regex,
    pub prepare_commands: Vec<String>,
    pub finish_commands: Vec<String>,
}

impl ApplyRecipe {
    pub fn from_config(config: &ApplyConfig) -> Result<Self> {
        Ok(Self {
            payload_path: config.payload_path.clone(),
            log_path: config.log_path.clone(),
            apply_command: config.apply_command.clone(),
            inspect_command: config.inspect_command.clone(),
            converging: compile("converging_pattern", &config.converging_pattern)?,
            contended: compile("contended_pattern", &config.contended_pattern)?,
            exclusive: compile("exclusive_pattern", &config.exclusive_pattern)?,
            error_entry: compile("error_entry_pattern", &config.error_entry_pattern)?,
            prepare_commands: config.prepare_commands.clone(),
            finish_commands: config.finish_commands.clone(),
        })
    }

    pub fn payload_path(&self) -> &str {
        &self.payload_path
    }

    fn render(&self, template: &str) -> String {
        template
            .replace("{payload}", &self.payload_path)
            .replace("{log}", &self.log_path)
    }

    /// Removes artifacts an earlier run may have left behind.
    pub fn clear_command(&self) -> String {
        format!("rm -f {} {}", self.log_path, self.payload_path)
    }

    /// Applies the payload, keeps the engine's log and prints it. The exit
    /// status is the engine's.
    pub fn apply_command(&self) -> String {
        format!(
            "{} > {log} 2>&1; rc=$?; cat {log}; [ $rc -eq 0 ]",
            self.render(&self.apply_command),
            log = self.log_path
        )
    }

    pub fn inspect_command(&self) -> String {
        self.render(&self.inspect_command)
    }

    /// Classify the output of one apply attempt.
    ///
    /// Contention markers only count when the attempt failed; an exclusive
    /// notice always defers to the failure listing.
    pub fn classify(&self, result: &CommandResult) -> Attempt {
        let output = &result.output;
        if !result.success() {
            if self.converging.is_match(output) {
                return Attempt::Converging(first_match(&self.converging, output));
            }
            if self.contended.is_match(output) {
                return Attempt::Contended(first_match(&self.contended, output));
            }
        }
        if self.exclusive.is_match(output) {
            return Attempt::Exclusive(first_match(&self.exclusive, output));
        }
        if result.success() {
            return Attempt::Clean;
        }
        Attempt::Failed(output.trim().to_string())
    }

    /// Error entries in a failure listing, verbatim.
    pub fn error_entries(&self, listing: &str) -> Vec<String> {
        self.error_entry
            .find_iter(listing)
            .map(|m| m.as_str().trim_end().to_string())
            .collect()
    }
}

/// Optional packages that decide which management services can be enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageFeatures {
    /// k9sec package present: SSH server available.
    pub crypto: bool,
    /// mgbl package present: gRPC available.
    pub mgbl: bool,
}

impl ImageFeatures {
    pub fn all() -> Self {
        Self {
            crypto: true,
            mgbl: true,
        }
    }

    pub fn from_package_list(packages: &str) -> Self {
        Self {
            crypto: packages.contains("-k9sec"),
            mgbl: packages.contains("-mgbl"),
        }
    }

    /// Ask the guest package database.
    pub fn detect(session: &mut ConsoleSession, timeout: std::time::Duration) -> Result<Self> {
        let listing = session.exec("rpm -qa | grep -E 'k9sec|mgbl'", timeout)?;
        let features = Self::from_package_list(&listing.output);
        tracing::debug!(?features, "image features");
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe() -> ApplyRecipe {
        ApplyRecipe::from_config(&ApplyConfig::default()).unwrap()
    }

    fn result(exit_code: i32, output: &str) -> CommandResult {
        CommandResult {
            completed: true,
            exit_code,
            output: output.to_string(),
            truncated: false,
        }
    }

    #[test]
    fn test_classify_clean() {
        assert_eq!(recipe().classify(&result(0, "Configuration applied\n")), Attempt::Clean);
    }

    #[test]
    fn test_classify_converging_and_contended() {
        let r = recipe();
        assert!(matches!(
            r.classify(&result(1, "% System configuration still in progress. Try later\n")),
            Attempt::Converging(_)
        ));
        assert!(matches!(
            r.classify(&result(1, "% Commit lock not acquired\n")),
            Attempt::Contended(_)
        ));
    }

    #[test]
    fn test_contention_text_on_success_is_ignored() {
        assert_eq!(
            recipe().classify(&result(0, "previous lock not acquired, retried\n")),
            Attempt::Clean
        );
    }

    #[test]
    fn test_classify_exclusive_wins_over_exit_status() {
        let r = recipe();
        let out = "This session has entered exclusive mode successfully\n";
        assert!(matches!(r.classify(&result(0, out)), Attempt::Exclusive(_)));
        assert!(matches!(r.classify(&result(1, out)), Attempt::Exclusive(_)));
    }

    #[test]
    fn test_classify_other_failure_keeps_output() {
        assert_eq!(
            recipe().classify(&result(1, "% Invalid input detected at '^' marker.\n")),
            Attempt::Failed("% Invalid input detected at '^' marker.".into())
        );
    }

    #[test]
    fn test_error_entries() {
        let listing = "!! SEMANTIC ERRORS: This configuration was rejected by\n\
                       !! the system due to semantic errors.\n\
                       grpc\n port 57777\n\
                       !!% Invalid argument: port already in use\n";
        assert_eq!(
            recipe().error_entries(listing),
            vec!["!!% Invalid argument: port already in use"]
        );
        assert!(recipe().error_entries("").is_empty());
    }

    #[test]
    fn test_commands_render_paths() {
        let r = recipe();
        assert_eq!(
            r.clear_command(),
            "rm -f /tmp/iso2box-apply.log /tmp/iso2box-payload.cfg"
        );
        assert!(r
            .apply_command()
            .starts_with("source /pkg/bin/ztp_helper.sh && xrapply /tmp/iso2box-payload.cfg > /tmp/iso2box-apply.log 2>&1"));
    }

    #[test]
    fn test_bad_pattern_is_config_error() {
        let config = ApplyConfig {
            contended_pattern: "(".into(),
            ..ApplyConfig::default()
        };
        let err = ApplyRecipe::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("contended_pattern"));
    }

    #[test]
    fn test_features_from_package_list() {
        let f = ImageFeatures::from_package_list(
            "xrv64-k9sec-1.0.0.0-r611.x86_64\nxrv64-mgbl-3.0.0.0-r611.x86_64\n",
        );
        assert_eq!(f, ImageFeatures::all());
        assert_eq!(ImageFeatures::from_package_list(""), ImageFeatures::default());
    }
}
