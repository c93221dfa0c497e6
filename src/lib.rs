//! Console-driven installer for network OS images.
//!
//! Boots an install image in a VM, drives first-boot setup over the serial
//! console, applies a management configuration, checks the management path
//! and hands the VM to Vagrant for packaging.
//!
//! - `console` - channels, pattern matching, sessions, command execution
//! - `install` - the install state machine and the built-in first-boot script
//! - `apply` - configuration application with contention handling
//! - `setup` - guest preparation around the configuration payload
//! - `validate` - post-configuration liveness probes
//! - `pipeline` - per-node flow and concurrent multi-node runs
//! - `vbox`, `source` - external tool boundary

pub mod apply;
pub mod cancel;
pub mod config;
pub mod console;
pub mod diagnostics;
pub mod error;
pub mod install;
pub mod pipeline;
pub mod retry;
pub mod setup;
pub mod source;
pub mod topology;
pub mod validate;
pub mod vbox;

// Re-export commonly used items
pub use apply::{Applier, ApplicationOutcome, ApplyRecipe, ConfigurationPayload, ImageFeatures};
pub use cancel::CancelToken;
pub use config::BuildConfig;
pub use console::{ConsoleChannel, ConsoleSession, ExpectSpec, MatchResult, Pattern};
pub use error::{Error, Result};
pub use install::{network_os_script, Director, InstallScript};
pub use pipeline::{build_node, run_topology, BuildOptions, BuildPlan, LocalGuests, NodeReport, RunSummary, Verdict};
pub use setup::GuestSetup;
pub use topology::{Node, Topology};
pub use validate::{Health, Probe, Validator};
