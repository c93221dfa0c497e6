//! Byte channels to a guest console.
//!
//! Each backend spawns a reader thread that forwards raw chunks over an
//! mpsc channel, so the session can wait with a timeout. Chunks are not
//! line-split: prompts such as `Password:` never end with a newline.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::retry::{BoundedExponential, Disposition, Observation, RetryPolicy};

/// Outcome of one read attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ChannelRead {
    Data(Vec<u8>),
    /// Nothing arrived within the wait.
    Idle,
    /// The far end is gone.
    Closed,
}

/// Duplex byte stream bound to one guest console.
pub trait ConsoleChannel: Send {
    /// Human-readable endpoint (e.g. `localhost:65000`).
    fn endpoint(&self) -> &str;

    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Wait up to `wait` for the next chunk.
    fn read_chunk(&mut self, wait: Duration) -> ChannelRead;

    /// Release the underlying handle. Called at most once by the session.
    fn close(&mut self);
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || reader_thread(&mut source, tx));
    rx
}

fn reader_thread<R: Read>(source: &mut R, tx: Sender<Vec<u8>>) {
    let mut buf = [0u8; 4096];
    loop {
        match source.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

fn recv_chunk(rx: &Receiver<Vec<u8>>, wait: Duration) -> ChannelRead {
    match rx.recv_timeout(wait) {
        Ok(chunk) => ChannelRead::Data(chunk),
        Err(RecvTimeoutError::Timeout) => ChannelRead::Idle,
        Err(RecvTimeoutError::Disconnected) => ChannelRead::Closed,
    }
}

/// Serial console exposed by the hypervisor as a TCP server
/// (VirtualBox `--uartmode1 tcpserver <port>`).
pub struct TcpChannel {
    endpoint: String,
    stream: TcpStream,
    rx: Receiver<Vec<u8>>,
}

impl TcpChannel {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let endpoint = format!("{}:{}", host, port);
        let addr = endpoint
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Channel(format!("cannot resolve {}", endpoint)))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| Error::Channel(format!("connect {}: {}", endpoint, e)))?;
        stream.set_nodelay(true)?;
        let rx = spawn_reader(stream.try_clone()?);
        Ok(Self {
            endpoint,
            stream,
            rx,
        })
    }

    /// Connect while the VM is still bringing its UART up.
    ///
    /// The hypervisor only opens the TCP server once the VM is running, so
    /// refused connections are retried with bounded exponential backoff.
    pub fn connect_with_retry(
        host: &str,
        port: u16,
        policy: &mut BoundedExponential,
        cancel: &CancelToken,
    ) -> Result<Self> {
        loop {
            cancel.check()?;
            match Self::connect(host, port, Duration::from_secs(5)) {
                Ok(channel) => return Ok(channel),
                Err(e) => match policy.classify(&Observation::Transient(e.to_string())) {
                    Disposition::Retry(delay) => {
                        tracing::debug!(host, port, ?delay, "console not reachable yet: {}", e);
                        cancel.sleep(delay)?;
                    }
                    Disposition::Fatal(reason) => return Err(Error::Channel(reason)),
                    Disposition::Success => {
                        return Err(Error::Channel(format!("{}:{} unreachable: {}", host, port, e)))
                    }
                },
            }
        }
    }
}

impl ConsoleChannel for TcpChannel {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()
    }

    fn read_chunk(&mut self, wait: Duration) -> ChannelRead {
        recv_chunk(&self.rx, wait)
    }

    fn close(&mut self) {
        // unblocks the reader thread
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Console reached through a helper process, e.g.
/// `socat TCP:localhost:65000 -,raw,echo=0,escape=0x1d`.
pub struct ChildChannel {
    endpoint: String,
    child: Child,
    stdin: Option<ChildStdin>,
    rx: Receiver<Vec<u8>>,
}

impl ChildChannel {
    pub fn spawn(mut cmd: Command) -> Result<Self> {
        let endpoint = format!("{:?}", cmd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Channel(format!("spawn {}: {}", endpoint, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Channel("failed to get helper stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Channel("failed to get helper stdout".into()))?;
        Ok(Self {
            endpoint,
            child,
            stdin: Some(stdin),
            rx: spawn_reader(stdout),
        })
    }
}

impl ConsoleChannel for ChildChannel {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
        stdin.write_all(bytes)?;
        stdin.flush()
    }

    fn read_chunk(&mut self, wait: Duration) -> ChannelRead {
        recv_chunk(&self.rx, wait)
    }

    fn close(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_tcp_channel_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"Press RETURN to get started.").unwrap();
            let mut buf = [0u8; 1];
            sock.read_exact(&mut buf).unwrap();
            buf[0]
        });

        let mut channel = TcpChannel::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        let mut seen = Vec::new();
        while !seen.ends_with(b"started.") {
            match channel.read_chunk(Duration::from_secs(2)) {
                ChannelRead::Data(d) => seen.extend(d),
                other => panic!("unexpected {:?}", other),
            }
        }
        channel.write_all(b"\n").unwrap();
        assert_eq!(server.join().unwrap(), b'\n');

        channel.close();
        assert_eq!(channel.read_chunk(Duration::from_secs(2)), ChannelRead::Closed);
    }

    #[test]
    fn test_child_channel_echoes_through_helper() {
        let mut channel = ChildChannel::spawn(Command::new("cat")).unwrap();
        channel.write_all(b"show version\n").unwrap();

        let mut seen = Vec::new();
        while !seen.ends_with(b"show version\n") {
            match channel.read_chunk(Duration::from_secs(2)) {
                ChannelRead::Data(d) => seen.extend(d),
                other => panic!("unexpected {:?}", other),
            }
        }

        channel.close();
        assert!(channel.write_all(b"late\n").is_err());
    }

    #[test]
    fn test_connect_refused_exhausts_policy() {
        // bind then drop to get a port nothing listens on
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut policy = BoundedExponential::new(
            2,
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_secs(5),
        );
        let result =
            TcpChannel::connect_with_retry("127.0.0.1", port, &mut policy, &CancelToken::new());
        assert!(matches!(result, Err(Error::Channel(_))));
        assert_eq!(policy.state().attempts, 2);
    }
}
