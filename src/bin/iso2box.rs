//! Build a Vagrant box from a network OS install image.
//!
//! Creates a VirtualBox VM per topology node, drives installation and
//! management configuration over the serial console, checks the management
//! path, and packages every node that passed.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use iso2box::config::BuildConfig;
use iso2box::pipeline::{BuildOptions, BuildPlan, LocalGuests, RunSummary, Verdict};
use iso2box::source::{vm_name, ImageSource};
use iso2box::topology::Topology;
use iso2box::vbox::{
    console_hint, forget_host_keys, memory_for_image, nic_for_interface, package_and_cleanup,
    MachinePaths, SystemTools, VirtualMachine, VmBuilder,
};
use iso2box::{run_topology, CancelToken, ConfigurationPayload};

const BOOT_TIMEOUT: Duration = Duration::from_secs(300);
const POWER_OFF_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "iso2box")]
#[command(about = "Turn a network OS install image into a validated Vagrant box")]
struct Cli {
    /// Install image: a local path or a remote host:/path fetched with scp
    image: String,

    /// Build configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Topology file; defaults to one node named after the image
    #[arg(long)]
    topology: Option<PathBuf>,

    /// Configuration payload file, one command per line
    #[arg(long)]
    payload: Option<PathBuf>,

    /// Vagrantfile embedded into the box
    #[arg(long)]
    vagrantfile: Option<PathBuf>,

    /// User for remote image sources without one
    #[arg(long)]
    remote_user: Option<String>,

    /// Skip the management path check
    #[arg(short, long)]
    skip_test: bool,

    /// Debug-level logging (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,

    /// Leave VMs running on failure for manual inspection
    #[arg(short, long)]
    debug: bool,

    /// Also export an OVA
    #[arg(short = 'o', long)]
    create_ova: bool,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Trip `cancel` on Ctrl-C.
fn install_sigint(cancel: &CancelToken) {
    // SAFETY: the handler only stores to an atomic
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
    let cancel = cancel.clone();
    std::thread::spawn(move || loop {
        if INTERRUPTED.load(Ordering::SeqCst) {
            tracing::warn!("interrupted, cancelling");
            cancel.cancel();
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    });
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = run(&cli)?;
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<i32> {
    let config = match &cli.config {
        Some(path) => BuildConfig::load(path)?,
        None => BuildConfig::default(),
    };
    let cancel = CancelToken::new();
    install_sigint(&cancel);

    let tools = SystemTools;
    let workdir = std::env::current_dir().context("reading working directory")?;

    let source = ImageSource::parse(&cli.image);
    let image = source.fetch(&workdir, cli.remote_user.as_deref(), &tools)?;
    let image = std::fs::canonicalize(&image)
        .with_context(|| format!("resolving {}", image.display()))?;
    let image_name = source.file_name()?;

    let topology = match &cli.topology {
        Some(path) => Topology::load(path)?,
        None => Topology::single(&vm_name(&image)?),
    };

    let payload = cli
        .payload
        .as_deref()
        .map(ConfigurationPayload::from_file)
        .transpose()?;
    let options = BuildOptions {
        skip_validation: cli.skip_test,
        payload,
    };
    let plan = BuildPlan::new(&config, options)?;

    let machines_dir = absolute(&workdir, &config.output.machines_dir);
    let mut vms = Vec::new();
    for node in &topology.nodes {
        let memory = match node.memory_mb {
            Some(mb) => mb,
            None => memory_for_image(&image_name)?,
        };
        let mut builder = VmBuilder::new(&node.name, machines_dir.clone(), image.clone())
            .memory(memory)
            .cpus(node.cpus)
            .serial_ports(node.console_port, node.aux_port)
            .forward_management(node.management_port);
        for (i, link) in topology.links.iter().enumerate() {
            for ep in link.endpoints.iter().filter(|e| e.node == node.name) {
                let slot = nic_for_interface(&ep.interface).with_context(|| {
                    format!("{} {} has no NIC slot", ep.node, ep.interface)
                })?;
                builder = builder.internal_network(slot, &format!("iso2box-link{}", i));
            }
        }
        vms.push(VirtualMachine::new(
            builder,
            MachinePaths::new(&machines_dir, &node.name),
            &tools,
        ));
    }

    let ports: Vec<u16> = topology.nodes.iter().map(|n| n.management_port).collect();
    forget_host_keys(&tools, &ports);

    for vm in &vms {
        let started = vm
            .prepare(cli.create_ova)
            .and_then(|_| vm.create())
            .and_then(|_| vm.start(BOOT_TIMEOUT, &cancel));
        if let Err(e) = started {
            if !cli.debug {
                discard(&vms);
            }
            return Err(e.context(format!("starting {}", vm.name())));
        }
    }

    let summary = match run_topology(&topology, &plan, &LocalGuests::new(&config), &cancel) {
        Ok(summary) => summary,
        Err(e) => {
            if !cli.debug {
                discard(&vms);
            }
            return Err(e.into());
        }
    };
    print_summary(&summary);

    if cli.debug && !summary.passed() {
        println!();
        println!("{}", "VMs left running for inspection:".yellow().bold());
        for node in &topology.nodes {
            println!("  {}: {}", node.name, console_hint(&config.console.host, node.console_port));
        }
        return Ok(summary.exit_code());
    }

    let keep: Vec<bool> = summary.reports.iter().map(|r| r.verdict.is_success()).collect();
    let packaging = package_and_cleanup(
        &vms,
        &keep,
        cli.vagrantfile.as_deref(),
        cli.create_ova,
        POWER_OFF_TIMEOUT,
    );
    for out in &packaging.boxes {
        println!("{} {}", "Created".green(), out.display());
    }
    for e in &packaging.failures {
        println!("{} {:#}", "[FAIL]".red().bold(), e);
    }
    if !packaging.succeeded() {
        return Ok(1);
    }

    if summary.passed() {
        println!();
        println!("Single node use:");
        println!("  vagrant box add --name 'IOS XRv' <box> --force");
        println!("  vagrant init 'IOS XRv'");
        println!("  vagrant up");
    }
    Ok(summary.exit_code())
}

fn discard(vms: &[VirtualMachine<'_>]) {
    for vm in vms {
        if let Err(e) = vm.cleanup() {
            tracing::error!("cleaning up {}: {:#}", vm.name(), e);
        }
    }
}

fn absolute(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    for report in &summary.reports {
        match &report.verdict {
            Verdict::Healthy => println!(
                "{} {} ({:.0}s)",
                "[PASS]".green().bold(),
                report.node,
                report.elapsed_secs
            ),
            Verdict::Skipped => println!(
                "{} {} (validation skipped)",
                "[SKIP]".yellow().bold(),
                report.node
            ),
            Verdict::Unhealthy { reason } => println!(
                "{} {} management path unhealthy: {}",
                "[FAIL]".red().bold(),
                report.node,
                reason
            ),
            Verdict::Failed { phase, error } => println!(
                "{} {} failed during {}: {}",
                "[FAIL]".red().bold(),
                report.node,
                phase,
                error
            ),
        }
        if let Some(warnings) = &report.warnings {
            println!("       warnings: {}", warnings);
        }
        if let Some(dir) = &report.diagnostics {
            println!("       diagnostics: {}", dir.display());
        }
    }
}
