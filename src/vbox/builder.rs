//! VBoxManage command builder.
//!
//! Produces the ordered `VBoxManage` invocations that create a build VM:
//! register it, size it, wire NICs and serial ports, attach the install
//! image and an empty disk, and set the boot order.

use std::path::PathBuf;
use std::process::Command;

/// Host side of a guest serial port.
pub const CONSOLE_UART: (&str, &str) = ("0x3f8", "4");
pub const AUX_UART: (&str, &str) = ("0x2f8", "3");

const NIC_SLOTS: u8 = 8;
const CONTROLLER: &str = "IDE_Controller";

/// Builder for the VM definition.
#[derive(Debug, Clone)]
pub struct VmBuilder {
    name: String,
    base_dir: PathBuf,
    memory_mb: u32,
    cpus: u32,
    vram_mb: u32,
    disk: PathBuf,
    disk_mb: u32,
    dvd: PathBuf,
    console_port: u16,
    aux_port: u16,
    management_forward: Option<u16>,
    /// `(slot, network)` pairs for NICs on internal networks.
    internal: Vec<(u8, String)>,
}

impl VmBuilder {
    pub fn new(name: &str, base_dir: PathBuf, dvd: PathBuf) -> Self {
        let disk = base_dir.join(name).join(format!("{}.vdi", name));
        Self {
            name: name.to_string(),
            base_dir,
            memory_mb: 4096,
            cpus: 2,
            vram_mb: 12,
            disk,
            disk_mb: 46080,
            dvd,
            console_port: crate::topology::DEFAULT_CONSOLE_PORT,
            aux_port: crate::topology::DEFAULT_AUX_PORT,
            management_forward: None,
            internal: Vec::new(),
        }
    }

    pub fn memory(mut self, mb: u32) -> Self {
        self.memory_mb = mb;
        self
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    /// Serial ports exposed as local TCP servers.
    pub fn serial_ports(mut self, console: u16, aux: u16) -> Self {
        self.console_port = console;
        self.aux_port = aux;
        self
    }

    /// Forward a host port to guest port 22 on the management NIC.
    pub fn forward_management(mut self, host_port: u16) -> Self {
        self.management_forward = Some(host_port);
        self
    }

    /// Put NIC `slot` (2..=8) on internal network `network` instead of NAT.
    pub fn internal_network(mut self, slot: u8, network: &str) -> Self {
        self.internal.push((slot, network.to_string()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn disk(&self) -> &PathBuf {
        &self.disk
    }

    pub fn settings_file(&self) -> PathBuf {
        self.base_dir.join(&self.name).join(format!("{}.vbox", self.name))
    }

    /// Every command needed to define the VM, in order.
    pub fn build(&self) -> Vec<Command> {
        let mut cmds = vec![
            vbox(&[
                "createvm",
                "--name",
                &self.name,
                "--ostype",
                "Linux26_64",
                "--basefolder",
                &self.base_dir.display().to_string(),
            ]),
            vbox(&["registervm", &self.settings_file().display().to_string()]),
            self.modify(&["--vram", &self.vram_mb.to_string()]),
            self.modify(&["--memory", &self.memory_mb.to_string(), "--acpi", "on"]),
            self.modify(&["--cpus", &self.cpus.to_string()]),
        ];

        for slot in 1..=NIC_SLOTS {
            let nic = format!("--nic{}", slot);
            let nictype = format!("--nictype{}", slot);
            match self.internal.iter().find(|(s, _)| *s == slot) {
                Some((_, network)) => cmds.push(self.modify(&[
                    &nic,
                    "intnet",
                    &format!("--intnet{}", slot),
                    network,
                    &nictype,
                    "virtio",
                ])),
                None => cmds.push(self.modify(&[&nic, "nat", &nictype, "virtio"])),
            }
        }

        if let Some(port) = self.management_forward {
            cmds.push(self.modify(&["--natpf1", &format!("mgmt,tcp,,{},,22", port)]));
        }

        cmds.push(self.modify(&[
            "--uart1",
            CONSOLE_UART.0,
            CONSOLE_UART.1,
            "--uartmode1",
            "tcpserver",
            &self.console_port.to_string(),
        ]));
        cmds.push(self.modify(&[
            "--uart2",
            AUX_UART.0,
            AUX_UART.1,
            "--uartmode2",
            "tcpserver",
            &self.aux_port.to_string(),
        ]));

        let disk = self.disk.display().to_string();
        cmds.push(vbox(&[
            "createhd",
            "--filename",
            &disk,
            "--size",
            &self.disk_mb.to_string(),
        ]));
        cmds.push(vbox(&["storagectl", &self.name, "--name", CONTROLLER, "--add", "ide"]));
        cmds.push(self.attach("0", "hdd", &disk));
        cmds.push(self.attach("1", "dvddrive", &self.dvd.display().to_string()));
        cmds.push(self.modify(&["--boot1", "disk"]));
        cmds.push(self.modify(&["--boot2", "dvd"]));
        cmds
    }

    /// Headless start; the caller spawns it and polls for the running state.
    pub fn start_command(&self) -> Command {
        let mut cmd = Command::new("VBoxHeadless");
        cmd.args(["--startvm", &self.name]);
        cmd
    }

    fn modify(&self, args: &[&str]) -> Command {
        let mut cmd = vbox(&["modifyvm", &self.name]);
        cmd.args(args);
        cmd
    }

    fn attach(&self, port: &str, kind: &str, medium: &str) -> Command {
        vbox(&[
            "storageattach",
            &self.name,
            "--storagectl",
            CONTROLLER,
            "--port",
            port,
            "--device",
            "0",
            "--type",
            kind,
            "--medium",
            medium,
        ])
    }
}

pub(crate) fn vbox(args: &[&str]) -> Command {
    let mut cmd = Command::new("VBoxManage");
    cmd.args(args);
    cmd
}

/// NIC slot for a data-plane interface name: `...0/0/0/N` maps to slot
/// `N + 2` (slot 1 is management). `None` when it does not fit.
pub fn nic_for_interface(interface: &str) -> Option<u8> {
    let index: u8 = interface.rsplit('/').next()?.parse().ok()?;
    let slot = index.checked_add(2)?;
    (slot <= NIC_SLOTS).then_some(slot)
}

/// Render a command for logs.
pub fn display(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}
