//! Built-in first-boot script for IOS XR images.
//!
//! ```text
//! power-on ──banner──▶ root-user ──▶ root-secret ──▶ root-secret-again ──▶ login
//!    │                                                                     │
//!    └──────────── Username: ──▶ password ◀────────────────────────────────┘
//!                                   │
//!                                   ▼
//!                                 shell ──▶ terminal-length ──▶ terminal-width ──▶ installed
//! ```
//!
//! Interactive steps press enter on silence and recover from a leftover
//! configuration mode (`exit`) or an aborted commit (`no`). An image that
//! was already set up skips the account creation and goes straight to login.

use crate::config::{Credentials, InstallConfig};
use crate::console::Pattern;
use crate::error::Result;

use super::{Branch, InstallScript, InstallStep};

const BANNER: &str = "Press RETURN to get started";
const ROOT_USER: &str = "Enter root-system username:";
const SECRET: &str = "Enter secret:";
const SECRET_AGAIN: &str = "Enter secret again:";
const USERNAME: &str = "Username:";
const PASSWORD: &str = "Password:";
const LOGIN_INCORRECT: &str = "Login incorrect";
const UNCOMMITTED: &str = "Uncommitted changes found";

pub const TERMINAL_LENGTH: &str = "terminal length 0";
pub const TERMINAL_WIDTH: &str = "terminal width 300";

/// Build the install graph for an IOS XR first boot.
pub fn network_os_script(creds: &Credentials, install: &InstallConfig) -> Result<InstallScript> {
    let prompt = Pattern::regex(&install.prompt_regex)?;
    let config_prompt = Pattern::regex(&install.config_prompt_regex)?;
    let step = install.step_timeout();
    let limit = install.repeat_limit;
    let user = creds.username.as_str();
    let pass = creds.password.as_str();

    let shell_ready = || Branch::goto("terminal-length").send(TERMINAL_LENGTH);

    let steps = vec![
        InstallStep::new("power-on", install.boot_timeout())
            .on("banner", Pattern::literal(BANNER), Branch::goto("root-user").enter())
            .on("root-user", Pattern::literal(ROOT_USER), Branch::goto("root-secret").send(user))
            .on("username", Pattern::literal(USERNAME), Branch::goto("password").send(user))
            .on("config-mode", config_prompt.clone(), Branch::stay().send("exit"))
            .on("uncommitted", Pattern::literal(UNCOMMITTED), Branch::stay().send("no"))
            .on("prompt", prompt.clone(), shell_ready())
            .on_timeout(Branch::fail("no console output after power-on"))
            .repeat_limit(limit),
        InstallStep::new("root-user", step)
            .on("root-user", Pattern::literal(ROOT_USER), Branch::goto("root-secret").send(user))
            .on("username", Pattern::literal(USERNAME), Branch::goto("password").send(user))
            .on_timeout(Branch::stay().enter())
            .repeat_limit(limit),
        // "Enter secret again:" first: both start at the same offset
        InstallStep::new("root-secret", step)
            .on("secret-again", Pattern::literal(SECRET_AGAIN), Branch::goto("login").secret(pass))
            .on("secret", Pattern::literal(SECRET), Branch::goto("root-secret-again").secret(pass))
            .on_timeout(Branch::stay().enter())
            .repeat_limit(limit),
        InstallStep::new("root-secret-again", step)
            .on("secret-again", Pattern::literal(SECRET_AGAIN), Branch::goto("login").secret(pass))
            .on_timeout(Branch::stay().enter())
            .repeat_limit(limit),
        InstallStep::new("login", step)
            .on("username", Pattern::literal(USERNAME), Branch::goto("password").send(user))
            .on("config-mode", config_prompt.clone(), Branch::stay().send("exit"))
            .on("uncommitted", Pattern::literal(UNCOMMITTED), Branch::stay().send("no"))
            .on("prompt", prompt.clone(), shell_ready())
            .on_timeout(Branch::stay().enter())
            .repeat_limit(limit),
        InstallStep::new("password", step)
            .on("password", Pattern::literal(PASSWORD), Branch::goto("shell").secret(pass))
            .on_timeout(Branch::goto("login").enter()),
        InstallStep::new("shell", step)
            .on("login-incorrect", Pattern::literal(LOGIN_INCORRECT), Branch::goto("login"))
            .on("username", Pattern::literal(USERNAME), Branch::goto("password").send(user))
            .on("config-mode", config_prompt, Branch::stay().send("exit"))
            .on("uncommitted", Pattern::literal(UNCOMMITTED), Branch::stay().send("no"))
            .on("prompt", prompt.clone(), shell_ready())
            .on_timeout(Branch::stay().enter())
            .repeat_limit(limit),
        InstallStep::new("terminal-length", step)
            .on("prompt", prompt.clone(), Branch::goto("terminal-width").send(TERMINAL_WIDTH))
            .on_timeout(Branch::fail("no prompt after terminal length")),
        InstallStep::new("terminal-width", step)
            .on("prompt", prompt, Branch::installed())
            .on_timeout(Branch::fail("no prompt after terminal width")),
    ];

    InstallScript::new("power-on", steps)
}

/// Scripted IOS XR first boot for tests: answers each send the way the
/// real console does, then hands guest shell commands to `shell`.
#[cfg(test)]
pub(crate) struct FakeRouter {
    state: u8,
    shell: Box<dyn FnMut(&str) -> (String, i32) + Send>,
}

#[cfg(test)]
impl FakeRouter {
    pub(crate) const BOOT: &'static str =
        "Booting IOS-XR 64 bit\r\n\r\n!!!!!!!!!!!!!!!!!!!!\r\nPress RETURN to get started.\r\n";
    pub(crate) const PROMPT: &'static str = "\r\nRP/0/RP0/CPU0:ios#";

    pub(crate) fn new<F>(shell: F) -> Self
    where
        F: FnMut(&str) -> (String, i32) + Send + 'static,
    {
        Self {
            state: 0,
            shell: Box::new(shell),
        }
    }

    /// Past the first-boot dialog, at the exec prompt.
    pub(crate) fn logged_in<F>(shell: F) -> Self
    where
        F: FnMut(&str) -> (String, i32) + Send + 'static,
    {
        Self {
            state: 6,
            shell: Box::new(shell),
        }
    }

    pub(crate) fn respond(&mut self, line: &str) -> Vec<String> {
        let reply = match self.state {
            0 => "\r\n--- Administrative User Dialog ---\r\n\r\n  Enter root-system username: ",
            1 => "\r\n  Enter secret: ",
            2 => "\r\n  Enter secret again: ",
            3 => "\r\nUse the 'configure' command to modify this configuration.\r\nUser Access Verification\r\n\r\nUsername: ",
            4 => "\r\nPassword: ",
            5 => Self::PROMPT,
            _ => {
                if let Some(cmd) = crate::console::testing::exec_command(line) {
                    let (output, status) = (self.shell)(&cmd);
                    return crate::console::testing::exec_reply(line, &output, status)
                        .unwrap_or_default();
                }
                if line == crate::setup::GENERATE_HOST_KEY {
                    return vec![format!("{}\r\nHow many bits in the modulus [2048]: ", line)];
                }
                return vec![format!("{}{}", line, Self::PROMPT)];
            }
        };
        self.state += 1;
        vec![reply.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::console::testing::ScriptedChannel;
    use crate::console::ConsoleSession;
    use crate::install::Director;

    fn script() -> InstallScript {
        network_os_script(&Credentials::default(), &InstallConfig::default()).unwrap()
    }

    #[test]
    fn test_builtin_script_is_valid() {
        assert_eq!(script().len(), 9);
        assert_eq!(script().initial(), "power-on");
    }

    #[test]
    fn test_first_boot_reaches_installed() {
        let mut router = FakeRouter::new(|_| (String::new(), 0));
        let channel = ScriptedChannel::new()
            .chunk(FakeRouter::BOOT)
            .on_send(move |line| router.respond(line));
        let probe = channel.probe();
        let mut session = ConsoleSession::new(Box::new(channel), CancelToken::new());

        let report = Director::new(&mut session, &script()).run().unwrap();

        assert_eq!(
            report.path,
            vec![
                "power-on",
                "root-user",
                "root-secret",
                "root-secret-again",
                "login",
                "password",
                "shell",
                "terminal-length",
                "terminal-width"
            ]
        );
        assert_eq!(
            probe.sends(),
            vec![
                "",
                "vagrant",
                "vagrant",
                "vagrant",
                "vagrant",
                "vagrant",
                TERMINAL_LENGTH,
                TERMINAL_WIDTH
            ]
        );
        assert_eq!(session.transcript().matches(">>> <secret>").count(), 3);
    }

    #[test]
    fn test_stale_config_mode_is_exited() {
        let channel = ScriptedChannel::new()
            .chunk("\r\nRP/0/RP0/CPU0:ios(config)#")
            .on_send(|line| match line {
                "exit" => vec![FakeRouter::PROMPT.to_string()],
                other => vec![format!("{}{}", other, FakeRouter::PROMPT)],
            });
        let probe = channel.probe();
        let mut session = ConsoleSession::new(Box::new(channel), CancelToken::new());

        Director::new(&mut session, &script()).run().unwrap();
        assert_eq!(probe.sends(), vec!["exit", TERMINAL_LENGTH, TERMINAL_WIDTH]);
    }

    #[test]
    fn test_preconfigured_image_skips_account_creation() {
        let mut sent = 0;
        let channel = ScriptedChannel::new()
            .chunk("User Access Verification\r\n\r\nUsername: ")
            .on_send(move |_| {
                sent += 1;
                match sent {
                    1 => vec!["\r\nPassword: ".to_string()],
                    _ => vec![FakeRouter::PROMPT.to_string()],
                }
            });
        let mut session = ConsoleSession::new(Box::new(channel), CancelToken::new());
        let report = Director::new(&mut session, &script()).run().unwrap();
        assert_eq!(report.path[..3], ["power-on", "password", "shell"]);
    }
}
