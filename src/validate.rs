//! Post-configuration liveness check of the management path.
//!
//! A [`Probe`] makes one attempt and reports an [`Observation`]; the
//! [`Validator`] repeats it under a bounded exponential policy and turns the
//! end result into [`Health`]. Unhealthy is a verdict, not an error: only
//! cancellation aborts validation.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cancel::CancelToken;
use crate::config::ValidateConfig;
use crate::error::Result;
use crate::retry::{BoundedExponential, Disposition, Observation, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy(String),
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// One liveness attempt.
pub trait Probe {
    fn describe(&self) -> String;

    /// `Success`, or `Transient` with what was seen instead.
    fn check(&mut self) -> Observation;
}

/// Connects to a TCP service and waits for its greeting (`SSH-` for sshd).
pub struct TcpProbe {
    host: String,
    port: u16,
    banner: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: &str, port: u16, banner: &str, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            banner: banner.to_string(),
            timeout,
        }
    }

    fn attempt(&self) -> std::result::Result<(), String> {
        let endpoint = format!("{}:{}", self.host, self.port);
        let addr = endpoint
            .to_socket_addrs()
            .map_err(|e| format!("resolve {}: {}", endpoint, e))?
            .next()
            .ok_or_else(|| format!("cannot resolve {}", endpoint))?;
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| format!("connect {}: {}", endpoint, e))?;
        if self.banner.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + self.timeout;
        let mut seen = Vec::new();
        let mut buf = [0u8; 256];
        while Instant::now() < deadline {
            let wait = deadline.saturating_duration_since(Instant::now());
            stream
                .set_read_timeout(Some(wait.max(Duration::from_millis(1))))
                .map_err(|e| e.to_string())?;
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    seen.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&seen).contains(&self.banner) {
                        return Ok(());
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    break
                }
                Err(e) => return Err(format!("read {}: {}", endpoint, e)),
            }
        }

        let greeting = String::from_utf8_lossy(&seen);
        Err(format!(
            "{} did not greet with {:?} (got {:?})",
            endpoint,
            self.banner,
            greeting.trim()
        ))
    }
}

impl Probe for TcpProbe {
    fn describe(&self) -> String {
        format!("tcp {}:{} banner {:?}", self.host, self.port, self.banner)
    }

    fn check(&mut self) -> Observation {
        match self.attempt() {
            Ok(()) => Observation::Success,
            Err(reason) => Observation::Transient(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub health: Health,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Repeats a probe with bounded exponential backoff.
pub struct Validator {
    attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    max_elapsed: Duration,
}

impl Validator {
    pub fn new(
        attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        max_elapsed: Duration,
    ) -> Self {
        Self {
            attempts,
            initial_backoff,
            max_backoff,
            max_elapsed,
        }
    }

    pub fn from_config(config: &ValidateConfig) -> Self {
        Self::new(
            config.attempts,
            config.initial_backoff(),
            config.max_backoff(),
            config.max_elapsed(),
        )
    }

    pub fn run(&self, probe: &mut dyn Probe, cancel: &CancelToken) -> Result<ValidationReport> {
        let start = Instant::now();
        let mut policy = BoundedExponential::new(
            self.attempts,
            self.initial_backoff,
            self.max_backoff,
            self.max_elapsed,
        );
        let mut attempts = 0u32;
        tracing::info!(probe = %probe.describe(), "validating");

        let health = loop {
            cancel.check()?;
            attempts += 1;
            let observation = probe.check();
            match policy.classify(&observation) {
                Disposition::Success => break Health::Healthy,
                Disposition::Fatal(reason) => break Health::Unhealthy(reason),
                Disposition::Retry(delay) => {
                    tracing::info!(attempt = attempts, ?delay, "management path not ready: {:?}", observation);
                    cancel.sleep(delay)?;
                }
            }
        };

        match &health {
            Health::Healthy => tracing::info!(attempts, "management path healthy"),
            Health::Unhealthy(reason) => tracing::error!(attempts, "management path unhealthy: {}", reason),
        }
        Ok(ValidationReport {
            health,
            attempts,
            elapsed: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    fn quick() -> Validator {
        Validator::new(
            4,
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_secs(5),
        )
    }

    struct Flaky {
        failures_left: u32,
        calls: u32,
    }

    impl Probe for Flaky {
        fn describe(&self) -> String {
            "flaky".into()
        }

        fn check(&mut self) -> Observation {
            self.calls += 1;
            if self.failures_left == 0 {
                return Observation::Success;
            }
            self.failures_left -= 1;
            Observation::Transient("connection refused".into())
        }
    }

    #[test]
    fn test_healthy_after_transient_failures() {
        let mut probe = Flaky {
            failures_left: 2,
            calls: 0,
        };
        let report = quick().run(&mut probe, &CancelToken::new()).unwrap();
        assert_eq!(report.health, Health::Healthy);
        assert_eq!(report.attempts, 3);
    }

    #[test]
    fn test_unhealthy_is_reported_not_retried_forever() {
        let mut probe = Flaky {
            failures_left: u32::MAX,
            calls: 0,
        };
        let report = quick().run(&mut probe, &CancelToken::new()).unwrap();
        assert!(matches!(report.health, Health::Unhealthy(ref r) if r.contains("connection refused")));
        assert_eq!(probe.calls, 4);
    }

    #[test]
    fn test_cancelled_validation_is_error() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut probe = Flaky {
            failures_left: 0,
            calls: 0,
        };
        assert_eq!(quick().run(&mut probe, &cancel).unwrap_err().kind(), "cancelled");
        assert_eq!(probe.calls, 0);
    }

    #[test]
    fn test_tcp_probe_sees_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"SSH-2.0-Cisco-1.25\r\n").unwrap();
        });

        let mut probe = TcpProbe::new("127.0.0.1", port, "SSH-", Duration::from_secs(2));
        assert_eq!(probe.check(), Observation::Success);
        server.join().unwrap();
    }

    #[test]
    fn test_tcp_probe_wrong_banner_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"220 ftp ready\r\n").unwrap();
        });

        let mut probe = TcpProbe::new("127.0.0.1", port, "SSH-", Duration::from_millis(500));
        match probe.check() {
            Observation::Transient(reason) => assert!(reason.contains("220 ftp ready")),
            other => panic!("unexpected {:?}", other),
        }
        server.join().unwrap();
    }

    #[test]
    fn test_tcp_probe_refused_is_transient() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut probe = TcpProbe::new("127.0.0.1", port, "SSH-", Duration::from_millis(500));
        assert!(matches!(probe.check(), Observation::Transient(_)));
    }
}
