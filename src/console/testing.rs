//! Scripted console channel for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::channel::{ChannelRead, ConsoleChannel};

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

/// Shared view of what the code under test did to a [`ScriptedChannel`].
#[derive(Clone, Default)]
pub(crate) struct ChannelProbe {
    sends: Arc<Mutex<Vec<String>>>,
    closes: Arc<AtomicUsize>,
}

impl ChannelProbe {
    /// Every line written, without its terminator.
    pub(crate) fn sends(&self) -> Vec<String> {
        self.sends.lock().unwrap().clone()
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Replays queued output chunks and optionally answers each send.
pub(crate) struct ScriptedChannel {
    queue: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    hang_up: bool,
    probe: ChannelProbe,
}

impl ScriptedChannel {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            responder: None,
            hang_up: false,
            probe: ChannelProbe::default(),
        }
    }

    /// Queue one output chunk, delivered as a single read.
    pub(crate) fn chunk(mut self, text: &str) -> Self {
        self.queue.push_back(text.as_bytes().to_vec());
        self
    }

    /// Report the stream closed once the queue runs dry.
    pub(crate) fn hang_up(mut self) -> Self {
        self.hang_up = true;
        self
    }

    /// Answer each sent line with zero or more output chunks.
    pub(crate) fn on_send<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    pub(crate) fn probe(&self) -> ChannelProbe {
        self.probe.clone()
    }
}

impl ConsoleChannel for ScriptedChannel {
    fn endpoint(&self) -> &str {
        "scripted"
    }

    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let text = String::from_utf8_lossy(bytes);
        let line = text.trim_end_matches('\n').to_string();
        self.probe.sends.lock().unwrap().push(line.clone());
        if let Some(responder) = self.responder.as_mut() {
            for chunk in responder(&line) {
                self.queue.push_back(chunk.into_bytes());
            }
        }
        Ok(())
    }

    fn read_chunk(&mut self, wait: Duration) -> ChannelRead {
        if let Some(chunk) = self.queue.pop_front() {
            return ChannelRead::Data(chunk);
        }
        if self.hang_up {
            return ChannelRead::Closed;
        }
        std::thread::sleep(wait);
        ChannelRead::Idle
    }

    fn close(&mut self) {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Split an exec line into (start marker, command, done marker).
fn split_exec(line: &str) -> Option<(&str, &str, &str)> {
    let start_at = line.find("echo '___START_")? + "echo '".len();
    let start_end = start_at + line[start_at..].find('\'')?;
    let rest = line[start_end..].strip_prefix("'; ")?;
    let cmd_end = rest.rfind("; echo '___DONE_")?;
    let done_at = cmd_end + "; echo '".len();
    let done_end = done_at + rest[done_at..].find('\'')?;
    Some((
        &line[start_at..start_end],
        &rest[..cmd_end],
        &rest[done_at..done_end],
    ))
}

/// The guest command inside an exec line.
pub(crate) fn exec_command(line: &str) -> Option<String> {
    split_exec(line).map(|(_, cmd, _)| cmd.to_string())
}

/// What a guest shell prints for an exec line: the echo, the start marker,
/// `output`, and the done marker with `status`.
pub(crate) fn exec_reply(line: &str, output: &str, status: i32) -> Option<Vec<String>> {
    let (start, _, done) = split_exec(line)?;
    Some(vec![
        format!("{}\r\n", line),
        format!("{}\r\n{}", start, output.replace('\n', "\r\n")),
        format!("{} {}\r\nRP/0/RP0/CPU0:ios#", done, status),
    ])
}
