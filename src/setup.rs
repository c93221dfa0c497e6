//! Guest preparation around the configuration payload.
//!
//! Before the payload, CLI housekeeping runs at the exec prompt (ZTP off).
//! After it the guest is made usable as a Vagrant box: root login for the
//! app-hosting sshd, passwordless sudo and the Vagrant key for the login
//! user, the sshd service itself, and an RSA host key on crypto images.
//!
//! Host key generation asks for the modulus size, so it runs as a small
//! install script rather than a plain command.

use std::time::Duration;

use crate::apply::ImageFeatures;
use crate::config::{Credentials, InstallConfig, SetupConfig};
use crate::console::{ConsoleSession, ExpectSpec, MatchResult, Pattern};
use crate::error::{Error, Result};
use crate::install::{Branch, Director, InstallScript, InstallStep};
use crate::retry::{ContentionPolling, Disposition, Observation, RetryPolicy};

pub const GENERATE_HOST_KEY: &str = "crypto key generate rsa";
const MODULUS_QUESTION: &str = "How many bits in the modulus";
const REPLACE_QUESTION: &str = "Do you really want to replace them";
const SSHD_CONFIG: &str = "/etc/ssh/sshd_config_operns";

/// Shell commands granting the login user Vagrant-style access.
pub fn access_commands(creds: &Credentials, setup: &SetupConfig) -> Result<Vec<String>> {
    let user = creds.username.as_str();
    if user.is_empty() || !user.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
        return Err(Error::Config(format!("unusable login name {:?}", user)));
    }
    if setup.authorized_key.contains('\'') {
        return Err(Error::Config("setup.authorized_key contains a single quote".into()));
    }

    let mut commands = Vec::new();
    if setup.permit_root_login {
        commands.push(format!(
            "sed -i 's/PermitRootLogin no/PermitRootLogin yes/' {}",
            SSHD_CONFIG
        ));
    }
    if setup.passwordless_sudo {
        commands.push(format!(
            "echo '{} ALL=(ALL) NOPASSWD: ALL' | (EDITOR='tee -a' visudo)",
            user
        ));
    }
    if !setup.authorized_key.is_empty() {
        let home = format!("~{}/.ssh", user);
        commands.push(format!("[ -d {0} ] || mkdir {0}", home));
        commands.push(format!("chmod 0700 {}", home));
        commands.push(format!(
            "echo '{}' > {}/authorized_keys",
            setup.authorized_key, home
        ));
        commands.push(format!("chmod 0600 {}/authorized_keys", home));
        commands.push(format!("chown -R {0}:{0} {1}/", user, home));
    }
    if !setup.service.is_empty() {
        commands.push(format!("service {} start", setup.service));
    }
    Ok(commands)
}

/// Answers the host key dialog: confirm replacing old keys, give the
/// modulus size, wait for the prompt.
pub fn host_key_script(install: &InstallConfig, bits: u32, timeout: Duration) -> Result<InstallScript> {
    let prompt = Pattern::regex(&install.prompt_regex)?;
    let steps = vec![
        InstallStep::new("generate", timeout)
            .on("replace", Pattern::literal(REPLACE_QUESTION), Branch::stay().send("yes"))
            .on(
                "modulus",
                Pattern::literal(MODULUS_QUESTION),
                Branch::goto("modulus-sent").send(&bits.to_string()),
            )
            .on_timeout(Branch::fail("no modulus question after key generation started"))
            .repeat_limit(3),
        InstallStep::new("modulus-sent", timeout)
            .on("prompt", prompt, Branch::installed())
            .on_timeout(Branch::fail("no prompt after host key generation")),
    ];
    InstallScript::new("generate", steps)
}

struct ServiceWait {
    status: String,
    enable: String,
    ready: String,
    poll: Duration,
    deadline: Duration,
}

/// Compiled form of [`SetupConfig`].
pub struct GuestSetup {
    cli_commands: Vec<String>,
    prompt: Pattern,
    shell_prefix: String,
    shell_commands: Vec<String>,
    service: Option<ServiceWait>,
    host_key: Option<InstallScript>,
    timeout: Duration,
}

impl GuestSetup {
    pub fn new(setup: &SetupConfig, creds: &Credentials, install: &InstallConfig) -> Result<Self> {
        let timeout = setup.command_timeout();
        let service = (!setup.service.is_empty()).then(|| ServiceWait {
            status: format!("service {} status", setup.service),
            enable: format!("chkconfig --add {}", setup.service),
            ready: setup.service_ready.clone(),
            poll: setup.service_poll(),
            deadline: setup.service_deadline(),
        });
        let host_key = match setup.crypto_key_bits {
            0 => None,
            bits => Some(host_key_script(install, bits, timeout)?),
        };
        Ok(Self {
            cli_commands: setup.cli_commands.clone(),
            prompt: Pattern::regex(&install.prompt_regex)?,
            shell_prefix: setup.shell_prefix.clone(),
            shell_commands: access_commands(creds, setup)?,
            service,
            host_key,
            timeout,
        })
    }

    /// Housekeeping at the CLI before the payload goes in.
    pub fn before_payload(&self, session: &mut ConsoleSession) -> Result<()> {
        for cmd in &self.cli_commands {
            self.cli(session, cmd)?;
        }
        Ok(())
    }

    /// Vagrant access, the app-hosting sshd and, on crypto images, the
    /// SSH host key.
    pub fn after_payload(&self, session: &mut ConsoleSession, features: ImageFeatures) -> Result<()> {
        for cmd in &self.shell_commands {
            session.exec_ok_in(&self.shell_prefix, cmd, self.timeout)?;
        }
        if let Some(service) = &self.service {
            self.wait_for_service(session, service)?;
            session.exec_ok_in(&self.shell_prefix, &service.enable, self.timeout)?;
        }
        match &self.host_key {
            Some(script) if features.crypto => {
                tracing::info!("generating SSH host key");
                session.send(GENERATE_HOST_KEY)?;
                Director::new(session, script)
                    .with_deadline(self.timeout)
                    .run()?;
            }
            _ => tracing::debug!(crypto = features.crypto, "no SSH host key generated"),
        }
        tracing::info!("guest setup complete");
        Ok(())
    }

    /// Send a CLI line and wait for the prompt that follows its echo.
    fn cli(&self, session: &mut ConsoleSession, cmd: &str) -> Result<()> {
        session.send(cmd)?;
        // the echo comes first; a prompt before it is left over
        for (label, pattern) in [("echo", Pattern::literal(cmd)), ("prompt", self.prompt.clone())] {
            let spec = ExpectSpec::new(self.timeout).with(label, pattern);
            match session.expect(&spec)? {
                MatchResult::Matched { .. } => {}
                MatchResult::Timeout => {
                    return Err(Error::PatternTimeout {
                        context: format!("running `{}`", cmd),
                        waited: self.timeout,
                    })
                }
                MatchResult::Closed => {
                    return Err(Error::Channel(format!("console closed while running `{}`", cmd)))
                }
            }
        }
        Ok(())
    }

    fn wait_for_service(&self, session: &mut ConsoleSession, service: &ServiceWait) -> Result<()> {
        let mut policy = ContentionPolling::new(service.poll, service.deadline);
        loop {
            let result = session.exec_in(&self.shell_prefix, &service.status, self.timeout)?;
            let observation = if result.completed && result.output.contains(&service.ready) {
                Observation::Success
            } else {
                Observation::Converging(result.output.trim().to_string())
            };
            match policy.classify(&observation) {
                Disposition::Success => {
                    tracing::info!(attempts = policy.state().attempts + 1, "{} is up", service.status);
                    return Ok(());
                }
                Disposition::Retry(delay) => {
                    tracing::debug!(?delay, "waiting for `{}`", service.status);
                    session.cancel_token().sleep(delay)?;
                }
                Disposition::Fatal(reason) => {
                    tracing::error!("`{}` never reported ready: {}", service.status, reason);
                    return Err(Error::PatternTimeout {
                        context: format!("waiting for `{}` to report {:?}", service.status, service.ready),
                        waited: service.deadline,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::console::testing::{exec_command, exec_reply, ChannelProbe, ScriptedChannel};
    use crate::install::script::FakeRouter;

    fn setup_config() -> SetupConfig {
        SetupConfig {
            command_timeout_secs: 2,
            service_poll_secs: 0,
            service_deadline_secs: 2,
            ..SetupConfig::default()
        }
    }

    fn guest_setup(config: &SetupConfig) -> GuestSetup {
        GuestSetup::new(config, &Credentials::default(), &InstallConfig::default()).unwrap()
    }

    /// Logged-in router whose sshd reports running after `starting` polls.
    fn router(starting: usize) -> (ConsoleSession, ChannelProbe) {
        let mut polls = 0usize;
        let mut router = FakeRouter::logged_in(move |cmd| {
            if cmd.starts_with("service sshd_operns status") {
                polls += 1;
                if polls > starting {
                    return ("sshd_operns (pid 4242) is running...\n".into(), 0);
                }
                return ("sshd_operns is stopped\n".into(), 3);
            }
            (String::new(), 0)
        });
        let channel = ScriptedChannel::new().on_send(move |line| router.respond(line));
        let probe = channel.probe();
        let session =
            ConsoleSession::new(Box::new(channel), CancelToken::new()).with_shell_prefix("run ");
        (session, probe)
    }

    fn shell_commands(probe: &ChannelProbe) -> Vec<String> {
        probe.sends().iter().filter_map(|l| exec_command(l)).collect()
    }

    #[test]
    fn test_access_commands_for_vagrant_user() {
        let cmds = access_commands(&Credentials::default(), &SetupConfig::default()).unwrap();
        assert_eq!(
            cmds[0],
            "sed -i 's/PermitRootLogin no/PermitRootLogin yes/' /etc/ssh/sshd_config_operns"
        );
        assert_eq!(cmds[1], "echo 'vagrant ALL=(ALL) NOPASSWD: ALL' | (EDITOR='tee -a' visudo)");
        assert_eq!(cmds[2], "[ -d ~vagrant/.ssh ] || mkdir ~vagrant/.ssh");
        assert!(cmds[4].starts_with("echo 'ssh-rsa AAAAB3NzaC1yc2E"));
        assert!(cmds[4].ends_with("vagrant insecure public key' > ~vagrant/.ssh/authorized_keys"));
        assert_eq!(cmds[6], "chown -R vagrant:vagrant ~vagrant/.ssh/");
        assert_eq!(cmds.last().unwrap(), "service sshd_operns start");
    }

    #[test]
    fn test_access_commands_reject_quoting_hazards() {
        let creds = Credentials {
            username: "va grant".into(),
            password: "x".into(),
        };
        assert_eq!(
            access_commands(&creds, &SetupConfig::default()).unwrap_err().kind(),
            "config"
        );

        let setup = SetupConfig {
            authorized_key: "ssh-rsa AAAA 'evil'".into(),
            ..SetupConfig::default()
        };
        assert!(access_commands(&Credentials::default(), &setup).is_err());
    }

    #[test]
    fn test_disabled_steps_produce_no_commands() {
        let setup = SetupConfig {
            permit_root_login: false,
            passwordless_sudo: false,
            authorized_key: String::new(),
            service: String::new(),
            ..SetupConfig::default()
        };
        assert!(access_commands(&Credentials::default(), &setup).unwrap().is_empty());
    }

    #[test]
    fn test_ztp_terminate_before_payload() {
        let (mut session, probe) = router(0);
        guest_setup(&setup_config()).before_payload(&mut session).unwrap();
        assert_eq!(probe.sends(), vec!["ztp terminate noprompt"]);
    }

    #[test]
    fn test_cli_command_ignores_stale_prompt() {
        // shell commands complete normally, CLI lines are echoed but never
        // answered with a prompt
        let channel = ScriptedChannel::new()
            .on_send(|line| exec_reply(line, "", 0).unwrap_or_else(|| vec![format!("{}\r\n", line)]));
        let mut session =
            ConsoleSession::new(Box::new(channel), CancelToken::new()).with_shell_prefix("run ");
        session.exec_ok("true", Duration::from_secs(2)).unwrap();

        let config = SetupConfig {
            command_timeout_secs: 1,
            ..setup_config()
        };
        let err = guest_setup(&config).before_payload(&mut session).unwrap_err();
        assert_eq!(err.kind(), "pattern-timeout");
    }

    #[test]
    fn test_after_payload_on_crypto_image() {
        let (mut session, probe) = router(2);

        guest_setup(&setup_config())
            .after_payload(&mut session, ImageFeatures::all())
            .unwrap();

        let cmds = shell_commands(&probe);
        assert!(cmds[0].contains("PermitRootLogin yes"));
        assert!(cmds.iter().any(|c| c.contains("NOPASSWD")));
        assert!(cmds.iter().any(|c| c.ends_with("> ~vagrant/.ssh/authorized_keys")));
        let start = cmds.iter().position(|c| c == "service sshd_operns start").unwrap();
        let polls: Vec<_> = cmds[start + 1..]
            .iter()
            .take_while(|c| c.contains("status"))
            .collect();
        assert_eq!(polls.len(), 3);
        assert_eq!(cmds.last().unwrap(), "chkconfig --add sshd_operns");

        let sends = probe.sends();
        assert!(sends.iter().all(|l| !l.contains("___START_") || l.starts_with("bash -c ")));
        assert_eq!(sends[sends.len() - 2..], [GENERATE_HOST_KEY, "2048"]);
    }

    #[test]
    fn test_no_host_key_without_crypto() {
        let (mut session, probe) = router(0);
        guest_setup(&setup_config())
            .after_payload(&mut session, ImageFeatures::default())
            .unwrap();
        assert!(!probe.sends().iter().any(|l| l == GENERATE_HOST_KEY));
    }

    #[test]
    fn test_service_never_running_times_out() {
        let (mut session, _) = router(usize::MAX);
        let err = guest_setup(&setup_config())
            .after_payload(&mut session, ImageFeatures::default())
            .unwrap_err();
        assert_eq!(err.kind(), "pattern-timeout");
        assert!(err.to_string().contains("is running..."));
    }

    #[test]
    fn test_host_key_script_replaces_existing_keys() {
        let mut asked = false;
        let channel = ScriptedChannel::new().on_send(move |line| match line {
            GENERATE_HOST_KEY => vec![format!(
                "{}\r\nThe default keypair already exists. Do you really want to replace them? [yes/no]: ",
                line
            )],
            "yes" if !asked => {
                asked = true;
                vec!["yes\r\nHow many bits in the modulus [2048]: ".to_string()]
            }
            other => vec![format!("{}{}", other, FakeRouter::PROMPT)],
        });
        let probe = channel.probe();
        let mut session = ConsoleSession::new(Box::new(channel), CancelToken::new());
        let script = host_key_script(&InstallConfig::default(), 4096, Duration::from_secs(2)).unwrap();

        session.send(GENERATE_HOST_KEY).unwrap();
        let report = Director::new(&mut session, &script).run().unwrap();

        assert_eq!(report.path, vec!["generate", "modulus-sent"]);
        assert_eq!(probe.sends(), vec![GENERATE_HOST_KEY, "yes", "4096"]);
    }
}
