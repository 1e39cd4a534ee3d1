//! Module for the logical command channel to an OBD adapter
//!
//! ELM327 class adapters speak a line based protocol. A command is ASCII text terminated
//! with `\r`, the reply is one or more text lines finished off by a `>` prompt. Only one
//! command may be outstanding at any time, so [CommandChannel] queues callers in arrival
//! order and runs one request/response cycle at a time.

use std::{
    fmt::Display,
    sync::{
        Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::hardware::{Transport, TransportError};

/// Prompt byte sent by the adapter when it is ready for the next command
pub const PROMPT: u8 = b'>';

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by a command channel
pub enum ChannelError {
    /// The adapter sent nothing before the deadline
    #[error("timeout waiting for a reply to '{command}' after {elapsed:?}")]
    Timeout {
        /// Command that was sent
        command: String,
        /// Time waited before giving up
        elapsed: Duration,
    },
    /// The transport was closed, or the channel shut down, while the command was in flight
    #[error("transport closed while processing '{command}'")]
    TransportClosed {
        /// Command that was being processed
        command: String,
    },
    /// Underlying transport error
    #[error("transport error")]
    Transport(
        #[from]
        #[source]
        TransportError,
    ),
}

/// A single command line for the adapter.
///
/// Either an OBD request built from a service (mode) and optional PID, or an
/// adapter configuration command such as `ATZ`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    mode: Option<u8>,
    pid: Option<u8>,
    text: String,
}

impl Command {
    /// OBD request for a mode and PID, EG: `Command::pid(0x01, 0x0C)` sends `010C`
    pub fn pid<M: Into<u8>>(mode: M, pid: u8) -> Self {
        let mode = mode.into();
        Self {
            mode: Some(mode),
            pid: Some(pid),
            text: format!("{mode:02X}{pid:02X}"),
        }
    }

    /// OBD request for a mode without PID, EG: `Command::service(0x03)` sends `03`
    pub fn service<M: Into<u8>>(mode: M) -> Self {
        let mode = mode.into();
        Self {
            mode: Some(mode),
            pid: None,
            text: format!("{mode:02X}"),
        }
    }

    /// Adapter command. The `AT` prefix is added if missing, so `Command::at("Z")`
    /// and `Command::at("ATZ")` are the same
    pub fn at<T: AsRef<str>>(cmd: T) -> Self {
        let cmd = cmd.as_ref().trim();
        let text = if has_at_prefix(cmd) {
            cmd.to_string()
        } else {
            format!("AT{cmd}")
        };
        Self {
            mode: None,
            pid: None,
            text,
        }
    }

    /// Arbitrary command line, sent verbatim. If the text is a plain hex OBD request
    /// (`03`, `010C`, `01 0C`) the mode and PID are recorded as well
    pub fn raw<T: AsRef<str>>(text: T) -> Self {
        let text = text.as_ref().trim().to_string();
        let packed: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        let hex = packed.chars().all(|c| c.is_ascii_hexdigit());
        let byte = |i: usize| u8::from_str_radix(&packed[i..i + 2], 16).ok();
        let (mode, pid) = match (hex, packed.len()) {
            (true, 2) => (byte(0), None),
            (true, 4) => (byte(0), byte(2)),
            _ => (None, None),
        };
        Self { mode, pid, text }
    }

    /// OBD mode (service) of the request, if this is an OBD request
    pub fn get_mode(&self) -> Option<u8> {
        self.mode
    }

    /// PID of the request, if any
    pub fn get_pid(&self) -> Option<u8> {
        self.pid
    }

    /// Text sent to the adapter (without the line terminator)
    pub fn get_text(&self) -> &str {
        &self.text
    }

    /// True for adapter (`AT`) commands
    pub fn is_adapter_command(&self) -> bool {
        has_at_prefix(&self.text)
    }

    /// Bytes written to the transport
    pub fn to_wire(&self) -> Vec<u8> {
        let mut r = Vec::with_capacity(self.text.len() + 1);
        r.extend_from_slice(self.text.as_bytes());
        r.push(b'\r');
        r
    }
}

fn has_at_prefix(text: &str) -> bool {
    text.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("AT"))
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// The reply to one command, echo and prompt removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    lines: Vec<String>,
    elapsed: Duration,
    complete: bool,
}

impl RawResponse {
    /// Creates a response from already split lines
    pub fn new(lines: Vec<String>, elapsed: Duration, complete: bool) -> Self {
        Self {
            lines,
            elapsed,
            complete,
        }
    }

    /// Reply lines, trimmed and without empty lines
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Consumes the response, returning the lines
    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    /// True if the adapter replied with nothing but the prompt
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Time between writing the command and the end of the reply
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// False if the reply was cut off by the idle timeout rather than ended by the prompt
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

impl Display for RawResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.lines.join("\n"))
    }
}

/// Splits received bytes into trimmed non empty lines. If the first line is the echo of
/// `sent` it is dropped
pub fn split_reply(rx: &[u8], sent: &str) -> Vec<String> {
    let text = String::from_utf8_lossy(rx);
    let mut lines: Vec<String> = text
        .split(['\r', '\n'])
        .map(|l| l.trim().trim_end_matches(PROMPT as char).trim())
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect();
    if let Some(first) = lines.first() {
        if is_echo(first, sent) {
            lines.remove(0);
        }
    }
    lines
}

fn is_echo(line: &str, sent: &str) -> bool {
    let a = line.chars().filter(|c| !c.is_whitespace());
    let b = sent.chars().filter(|c| !c.is_whitespace());
    !sent.trim().is_empty() && a.map(|c| c.to_ascii_uppercase()).eq(b.map(|c| c.to_ascii_uppercase()))
}

/// Command channel timing configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelSettings {
    /// How long the adapter may stay silent before the reply is considered over
    pub read_timeout: Duration,
    /// Hard cap on a single request/response cycle, even if bytes keep arriving
    pub max_response_time: Duration,
    /// Granularity of the read loop. Bounds how quickly [CommandChannel::shutdown]
    /// interrupts a pending read
    pub poll_interval: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(2000),
            max_response_time: Duration::from_millis(10_000),
            poll_interval: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Default)]
struct TicketQueue {
    next: u64,
    serving: u64,
}

/// Serialized request/response channel over a [Transport]
#[derive(Debug)]
pub struct CommandChannel {
    transport: Mutex<Box<dyn Transport>>,
    queue: Mutex<TicketQueue>,
    turn: Condvar,
    shutdown: AtomicBool,
    settings: ChannelSettings,
}

// Releases the caller's place in the queue, even on early return
struct Turn<'a> {
    channel: &'a CommandChannel,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut q = lock(&self.channel.queue);
        q.serving += 1;
        self.channel.turn.notify_all();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CommandChannel {
    /// Creates a channel over an already opened transport
    pub fn new(transport: Box<dyn Transport>, settings: ChannelSettings) -> Self {
        Self {
            transport: Mutex::new(transport),
            queue: Mutex::new(TicketQueue::default()),
            turn: Condvar::new(),
            shutdown: AtomicBool::new(false),
            settings,
        }
    }

    /// Channel settings
    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    /// Sends a command and waits for its reply using the configured read timeout
    pub fn send(&self, command: &Command) -> ChannelResult<RawResponse> {
        self.send_with_timeout(command, self.settings.read_timeout)
    }

    /// Sends a command and waits for its reply, allowing the adapter to stay silent
    /// for up to `read_timeout`. Used for slow commands such as a reset.
    ///
    /// Blocks until all earlier callers have been served
    pub fn send_with_timeout(
        &self,
        command: &Command,
        read_timeout: Duration,
    ) -> ChannelResult<RawResponse> {
        let _turn = self.wait_turn();
        if self.is_shut_down() {
            return Err(ChannelError::TransportClosed {
                command: command.get_text().to_string(),
            });
        }
        let mut transport = lock(&self.transport);
        self.exchange(transport.as_mut(), command, read_timeout)
    }

    /// Number of callers waiting for, or holding, the channel
    pub fn queue_len(&self) -> u64 {
        let q = lock(&self.queue);
        q.next - q.serving
    }

    /// Aborts any pending read and closes the transport.
    /// Every later send fails with [ChannelError::TransportClosed]
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // The reader drops the transport lock within one poll interval
        let mut transport = lock(&self.transport);
        transport.close();
    }

    /// True once [CommandChannel::shutdown] has been called
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// True if the channel can still carry commands
    pub fn is_open(&self) -> bool {
        !self.is_shut_down() && lock(&self.transport).is_open()
    }

    fn wait_turn(&self) -> Turn<'_> {
        let mut q = lock(&self.queue);
        let ticket = q.next;
        q.next += 1;
        while q.serving != ticket {
            q = self.turn.wait(q).unwrap_or_else(PoisonError::into_inner);
        }
        Turn { channel: self }
    }

    fn exchange(
        &self,
        transport: &mut dyn Transport,
        command: &Command,
        read_timeout: Duration,
    ) -> ChannelResult<RawResponse> {
        let map_err = |e: TransportError| match e {
            TransportError::NotOpen(_) | TransportError::Closed(_) => {
                ChannelError::TransportClosed {
                    command: command.get_text().to_string(),
                }
            }
            e => ChannelError::Transport(e),
        };
        if !transport.is_open() {
            return Err(ChannelError::TransportClosed {
                command: command.get_text().to_string(),
            });
        }
        // Anything still buffered belongs to an earlier, abandoned command
        transport.discard_input_buffer().map_err(map_err)?;
        log::debug!("Sending to adapter: {command}");
        transport.write(&command.to_wire()).map_err(map_err)?;

        let started = Instant::now();
        let mut last_rx = started;
        let mut rx: Vec<u8> = Vec::with_capacity(64);
        let mut complete = false;
        loop {
            if self.is_shut_down() {
                return Err(ChannelError::TransportClosed {
                    command: command.get_text().to_string(),
                });
            }
            let now = Instant::now();
            let idle_left = read_timeout.saturating_sub(now - last_rx);
            let total_left = self.settings.max_response_time.saturating_sub(now - started);
            if idle_left.is_zero() || total_left.is_zero() {
                break;
            }
            let slice = idle_left.min(total_left).min(self.settings.poll_interval);
            match transport.read_byte(slice).map_err(map_err)? {
                Some(PROMPT) => {
                    complete = true;
                    break;
                }
                Some(b) => {
                    rx.push(b);
                    last_rx = Instant::now();
                }
                None => {}
            }
        }
        let elapsed = started.elapsed();

        if !complete {
            transport.discard_input_buffer().map_err(map_err)?;
            if rx.iter().all(|b| b.is_ascii_whitespace() || *b == 0x00) {
                return Err(ChannelError::Timeout {
                    command: command.get_text().to_string(),
                    elapsed,
                });
            }
            log::debug!("No prompt after {elapsed:?}, using partial reply to {command}");
        }

        let lines = split_reply(&rx, command.get_text());
        log::trace!("Adapter reply to {command} in {elapsed:?}: {lines:?}");
        Ok(RawResponse::new(lines, elapsed, complete))
    }
}
