//! VirtualBox and Vagrant boundary.
//!
//! Thin wrappers around `VBoxManage`, `VBoxHeadless`, `vagrant` and
//! `ssh-keygen`. Everything here shells out; failures carry the tool's
//! stderr through `anyhow` context.

pub mod builder;

pub use builder::{nic_for_interface, VmBuilder};

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use builder::{display, vbox};

/// Guest RAM from the image name.
pub fn memory_for_image(image: &str) -> Result<u32> {
    if image.contains("mini") {
        Ok(3072)
    } else if image.contains("full") {
        Ok(4096)
    } else {
        bail!("{} is neither a mini nor a full image", image)
    }
}

/// Runs external tools. Swapped out in tests.
pub trait ToolRunner: Sync {
    /// Run to completion; stdout on success.
    fn run(&self, cmd: &mut Command) -> Result<String>;

    /// Start detached; output discarded.
    fn spawn(&self, cmd: &mut Command) -> Result<()>;
}

pub struct SystemTools;

impl ToolRunner for SystemTools {
    fn run(&self, cmd: &mut Command) -> Result<String> {
        let line = display(cmd);
        tracing::debug!(command = %line, "running");
        let output = cmd
            .output()
            .with_context(|| format!("failed to run {}", line))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            bail!(
                "{} failed ({}): {}",
                line,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(stdout)
    }

    fn spawn(&self, cmd: &mut Command) -> Result<()> {
        let line = display(cmd);
        tracing::debug!(command = %line, "spawning");
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to start {}", line))?;
        Ok(())
    }
}

/// Where a build VM and its outputs live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachinePaths {
    pub base_dir: PathBuf,
    pub box_dir: PathBuf,
    pub box_out: PathBuf,
    pub ova_out: PathBuf,
}

impl MachinePaths {
    pub fn new(machines_dir: &Path, name: &str) -> Self {
        let box_dir = machines_dir.join(name);
        Self {
            base_dir: machines_dir.to_path_buf(),
            box_out: box_dir.join(format!("{}.box", name)),
            ova_out: box_dir.join(format!("{}.ova", name)),
            box_dir,
        }
    }
}

/// One build VM and the commands that drive its lifecycle.
pub struct VirtualMachine<'a> {
    builder: VmBuilder,
    paths: MachinePaths,
    tools: &'a dyn ToolRunner,
    poll: Duration,
}

impl<'a> VirtualMachine<'a> {
    pub fn new(builder: VmBuilder, paths: MachinePaths, tools: &'a dyn ToolRunner) -> Self {
        Self {
            builder,
            paths,
            tools,
            poll: Duration::from_secs(5),
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn name(&self) -> &str {
        self.builder.name()
    }

    pub fn paths(&self) -> &MachinePaths {
        &self.paths
    }

    /// Remove leftovers of a previous run of the same VM.
    pub fn prepare(&self, create_ova: bool) -> Result<()> {
        std::fs::create_dir_all(&self.paths.box_dir)
            .with_context(|| format!("creating {}", self.paths.box_dir.display()))?;
        if self.paths.box_out.exists() {
            std::fs::remove_file(&self.paths.box_out)
                .with_context(|| format!("removing {}", self.paths.box_out.display()))?;
        }
        if create_ova && self.paths.ova_out.exists() {
            std::fs::remove_file(&self.paths.ova_out)
                .with_context(|| format!("removing {}", self.paths.ova_out.display()))?;
        }
        self.cleanup()
    }

    pub fn create(&self) -> Result<()> {
        tracing::info!(vm = %self.name(), "creating VM");
        for mut cmd in self.builder.build() {
            self.tools.run(&mut cmd)?;
        }
        Ok(())
    }

    /// Start headless and wait until VirtualBox reports it running.
    pub fn start(&self, timeout: Duration, cancel: &CancelToken) -> Result<()> {
        self.tools.spawn(&mut self.builder.start_command())?;
        let start = Instant::now();
        loop {
            let info = self.tools.run(&mut vbox(&["showvminfo", self.name()]))?;
            if info.contains("running (since") {
                tracing::info!(vm = %self.name(), "VM running");
                return Ok(());
            }
            if start.elapsed() >= timeout {
                bail!("{} did not reach the running state within {:?}", self.name(), timeout);
            }
            tracing::debug!(vm = %self.name(), "waiting for VM to start");
            cancel.sleep(self.poll)?;
        }
    }

    pub fn is_running(&self) -> Result<bool> {
        let running = self.tools.run(&mut vbox(&["list", "runningvms"]))?;
        Ok(lists_vm(&running, self.name()))
    }

    /// Power off and wait until it leaves the running list.
    pub fn power_off(&self, timeout: Duration) -> Result<()> {
        self.tools
            .run(&mut vbox(&["controlvm", self.name(), "poweroff"]))?;
        let start = Instant::now();
        while self.is_running()? {
            if start.elapsed() >= timeout {
                bail!("{} still running {:?} after poweroff", self.name(), timeout);
            }
            std::thread::sleep(self.poll.min(Duration::from_secs(1)));
        }
        tracing::info!(vm = %self.name(), "VM powered off");
        Ok(())
    }

    /// Detach serial ports and compact the disk before packaging.
    pub fn seal(&self) -> Result<()> {
        self.tools
            .run(&mut vbox(&["modifyvm", self.name(), "--uart1", "off"]))?;
        self.tools
            .run(&mut vbox(&["modifyvm", self.name(), "--uart2", "off"]))?;
        let disk = self.builder.disk().display().to_string();
        self.tools
            .run(&mut vbox(&["modifymedium", "--compact", &disk]))?;
        Ok(())
    }

    /// `vagrant package` the VM, optionally also exporting an OVA.
    pub fn package(&self, vagrantfile: Option<&Path>, create_ova: bool) -> Result<PathBuf> {
        let mut cmd = Command::new("vagrant");
        cmd.args(["package", "--base", self.name()]);
        if let Some(file) = vagrantfile {
            cmd.arg("--vagrantfile").arg(file);
        }
        cmd.arg("--output").arg(&self.paths.box_out);
        self.tools.run(&mut cmd)?;
        tracing::info!(path = %self.paths.box_out.display(), "box created");

        if create_ova {
            let mut export = vbox(&["export", self.name(), "--output"]);
            export.arg(&self.paths.ova_out);
            self.tools.run(&mut export)?;
            tracing::info!(path = %self.paths.ova_out.display(), "OVA created");
        }
        Ok(self.paths.box_out.clone())
    }

    /// Power off if running, then unregister and delete.
    pub fn cleanup(&self) -> Result<()> {
        if self.is_running()? {
            tracing::debug!(vm = %self.name(), "powering off leftover VM");
            self.tools
                .run(&mut vbox(&["controlvm", self.name(), "poweroff"]))?;
        }
        let registered = self.tools.run(&mut vbox(&["list", "vms"]))?;
        if lists_vm(&registered, self.name()) {
            tracing::debug!(vm = %self.name(), "unregistering VM");
            let settings = self.builder.settings_file().display().to_string();
            self.tools
                .run(&mut vbox(&["unregistervm", &settings, "--delete"]))?;
        }
        Ok(())
    }
}

/// Boxes written and errors met while finishing a run.
#[derive(Debug, Default)]
pub struct Packaging {
    pub boxes: Vec<PathBuf>,
    pub failures: Vec<anyhow::Error>,
}

impl Packaging {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Package every VM whose `keep` flag is set, then clean up all of them.
///
/// A failing VM does not stop the rest: every VM still gets its cleanup and
/// all errors are collected.
pub fn package_and_cleanup(
    vms: &[VirtualMachine<'_>],
    keep: &[bool],
    vagrantfile: Option<&Path>,
    create_ova: bool,
    power_off_timeout: Duration,
) -> Packaging {
    let mut done = Packaging::default();
    for (i, vm) in vms.iter().enumerate() {
        if keep.get(i).copied().unwrap_or(false) {
            let packaged = vm
                .power_off(power_off_timeout)
                .and_then(|_| vm.seal())
                .and_then(|_| vm.package(vagrantfile, create_ova))
                .with_context(|| format!("packaging {}", vm.name()));
            match packaged {
                Ok(out) => done.boxes.push(out),
                Err(e) => {
                    tracing::error!("{:#}", e);
                    done.failures.push(e);
                }
            }
        }
        if let Err(e) = vm.cleanup().with_context(|| format!("cleaning up {}", vm.name())) {
            tracing::error!("{:#}", e);
            done.failures.push(e);
        }
    }
    done
}

/// `VBoxManage list` prints `"<name>" {<uuid>}` per VM.
fn lists_vm(listing: &str, name: &str) -> bool {
    let quoted = format!("\"{}\"", name);
    listing.lines().any(|l| l.trim_start().starts_with(&quoted))
}

/// Drop stale host keys for forwarded management ports.
pub fn forget_host_keys(tools: &dyn ToolRunner, ports: &[u16]) {
    for port in ports {
        let mut cmd = Command::new("ssh-keygen");
        cmd.args(["-R", &format!("[localhost]:{}", port)]);
        // no known_hosts entry is not a problem
        if let Err(e) = tools.run(&mut cmd) {
            tracing::debug!("ssh-keygen -R for port {}: {:#}", port, e);
        }
    }
}

/// Command to attach to a VM console by hand.
pub fn console_hint(host: &str, port: u16) -> String {
    format!("socat TCP:{}:{} -,raw,echo=0,escape=0x1d", host, port)
}
