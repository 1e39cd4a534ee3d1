//! Module for the OBD2 (SAE J1979) protocol engine on top of an ELM327 command channel
//!
//! The engine turns high level requests (read a PID, read the stored DTCs, read the VIN)
//! into adapter commands, then validates and decodes the text the adapter sends back.
//!
//! Adapter replies come in a few shapes, all handled by [parse_messages]:
//!
//! ```text
//! 41 0C 1A F8              single frame, spaces on
//! 410C1AF8                 single frame, spaces off
//! 014                      ISO-TP multi frame: total length...
//! 0: 49 02 01 31 47 31     ...then indexed frames
//! 1: 4A 43 35 34 34 34 52
//! ```

use automotive_diag::obd2::Obd2ErrorByte;

use crate::channel::{ChannelError, Command, RawResponse};

mod data_pids;
mod engine;
mod protocol;
mod service01;
mod service03;
mod service09;
mod units;

// Exports
pub use data_pids::*;
pub use engine::*;
pub use protocol::*;
pub use units::*;

/// Protocol engine result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by the protocol engine
pub enum ProtocolError {
    /// An adapter initialization step failed
    #[error("adapter initialization failed at step '{step}', reply: '{reply}'")]
    InitFailed {
        /// Step that failed
        step: InitStep,
        /// What the adapter sent back. Empty if nothing arrived
        reply: String,
    },
    /// The vehicle did not answer (`NO DATA`, `UNABLE TO CONNECT`)
    #[error("no data from the vehicle for '{command}'")]
    NoData {
        /// Command sent
        command: String,
    },
    /// The adapter did not understand the command (`?`)
    #[error("adapter rejected '{command}'")]
    Rejected {
        /// Command sent
        command: String,
    },
    /// The adapter reported a bus or internal error
    #[error("adapter error for '{command}': {message}")]
    AdapterError {
        /// Command sent
        command: String,
        /// Error text sent by the adapter, EG: `CAN ERROR`
        message: String,
    },
    /// The ECU sent a negative response
    #[error("ECU negative response 0x{code:02X} ({def}) for '{command}'")]
    EcuError {
        /// Command sent
        command: String,
        /// Raw negative response code
        code: u8,
        /// Definition of the code
        def: String,
    },
    /// The adapter sent only the prompt
    #[error("empty reply to '{command}'")]
    EmptyResponse {
        /// Command sent
        command: String,
    },
    /// The reply does not answer the command that was sent
    #[error("reply to '{command}' does not match the request: '{reply}'")]
    MismatchedResponse {
        /// Command sent
        command: String,
        /// Reply received
        reply: String,
    },
    /// The reply answers the command but its payload can not be decoded
    #[error("malformed payload for '{command}': {reason}")]
    MalformedPayload {
        /// Command sent
        command: String,
        /// What was wrong with it
        reason: String,
    },
    /// Clearing DTCs failed. Never retried automatically
    #[error("clearing DTCs failed: {0}")]
    ClearFailed(String),
    /// Error with the underlying command channel
    #[error("command channel error")]
    Channel(
        #[from]
        #[source]
        ChannelError,
    ),
}

/// Function to decode PID support response from ECU
pub(crate) fn decode_pid_response(x: &[u8]) -> Vec<bool> {
    let mut resp: Vec<bool> = Vec::new();
    for b in x {
        let mut mask: u8 = 0b10000000;
        for _ in 0..8 {
            resp.push(b & mask != 0x00);
            mask >>= 1;
        }
    }
    resp
}

/// Lines the adapter prints while working that carry no data. A failed bus init
/// (`BUS INIT: ...ERROR`) is not one of them
fn is_informational(line: &str) -> bool {
    let upper = line.to_ascii_uppercase();
    if upper.starts_with("SEARCHING") {
        return true;
    }
    (upper.starts_with("BUS INIT") || upper.starts_with("BUSINIT")) && !upper.contains("ERROR")
}

fn hex_bytes(text: &str) -> Option<Vec<u8>> {
    let packed: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if packed.is_empty() || packed.len() % 2 != 0 {
        return None;
    }
    packed
        .chunks_exact(2)
        .map(|c| {
            std::str::from_utf8(c)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
        })
        .collect()
}

// `0:` .. `F:` prefix of a multi frame line
fn frame_index(line: &str) -> Option<(u8, &str)> {
    let (idx, rest) = line.split_once(':')?;
    let idx = idx.trim();
    if idx.len() != 1 {
        return None;
    }
    u8::from_str_radix(idx, 16).ok().map(|i| (i, rest))
}

// 3 hex digit total length line preceding a multi frame reply
fn length_line(line: &str) -> Option<usize> {
    let t = line.trim();
    if t.len() == 3 && t.chars().all(|c| c.is_ascii_hexdigit()) {
        usize::from_str_radix(t, 16).ok()
    } else {
        None
    }
}

/// Splits reply lines into OBD messages.
///
/// Each single frame line is one message. A length line followed by `N:` lines is
/// reassembled into one message, with padding beyond the announced length removed.
/// Informational lines are skipped. Returns `None` if a line is neither
pub fn parse_messages<S: AsRef<str>>(lines: &[S]) -> Option<Vec<Vec<u8>>> {
    let mut messages = Vec::new();
    let mut multi: Option<(Option<usize>, Vec<u8>)> = None;
    let flush = |multi: &mut Option<(Option<usize>, Vec<u8>)>, messages: &mut Vec<Vec<u8>>| {
        if let Some((len, mut buf)) = multi.take() {
            if let Some(len) = len {
                buf.truncate(len);
            }
            messages.push(buf);
        }
    };
    for line in lines.iter().map(|l| l.as_ref().trim()) {
        if line.is_empty() || is_informational(line) {
            continue;
        }
        if let Some(len) = length_line(line) {
            flush(&mut multi, &mut messages);
            multi = Some((Some(len), Vec::with_capacity(len)));
        } else if let Some((_, rest)) = frame_index(line) {
            let bytes = hex_bytes(rest)?;
            multi
                .get_or_insert_with(|| (None, Vec::new()))
                .1
                .extend(bytes);
        } else {
            flush(&mut multi, &mut messages);
            messages.push(hex_bytes(line)?);
        }
    }
    flush(&mut multi, &mut messages);
    Some(messages)
}

/// Checks a reply for adapter error words and decodes its messages
pub(crate) fn reply_messages(command: &Command, resp: &RawResponse) -> ProtocolResult<Vec<Vec<u8>>> {
    let cmd = || command.get_text().to_string();
    let lines: Vec<&str> = resp
        .lines()
        .iter()
        .map(|l| l.as_str())
        .filter(|l| !is_informational(l))
        .collect();
    if lines.is_empty() {
        return Err(ProtocolError::EmptyResponse { command: cmd() });
    }
    if let Some(messages) = parse_messages(&lines) {
        if !messages.is_empty() {
            return Ok(messages);
        }
    }
    // Not data, so it is something the adapter has to say about the request
    let word = lines
        .iter()
        .copied()
        .find(|l| hex_bytes(l).is_none() && length_line(l).is_none() && frame_index(l).is_none())
        .unwrap_or(lines[0]);
    let upper = word.to_ascii_uppercase();
    Err(if upper == "?" {
        ProtocolError::Rejected { command: cmd() }
    } else if upper.contains("NO DATA") || upper.contains("UNABLE TO CONNECT") {
        ProtocolError::NoData { command: cmd() }
    } else {
        ProtocolError::AdapterError {
            command: cmd(),
            message: word.to_string(),
        }
    })
}

/// Finds the positive response to `mode`/`pid` among the messages and returns the bytes
/// after the echoed header
pub(crate) fn find_response(
    command: &Command,
    messages: &[Vec<u8>],
    mode: u8,
    pid: Option<u8>,
) -> ProtocolResult<Vec<u8>> {
    let mut header = vec![mode.wrapping_add(0x40)];
    header.extend(pid);
    if let Some(m) = messages.iter().find(|m| m.starts_with(&header)) {
        return Ok(m[header.len()..].to_vec());
    }
    if let Some(nrc) = messages
        .iter()
        .find(|m| m.len() >= 3 && m[0] == 0x7F && m[1] == mode)
    {
        let code = nrc[2];
        return Err(ProtocolError::EcuError {
            command: command.get_text().to_string(),
            code,
            def: format!("{:?}", Obd2ErrorByte::from(code)),
        });
    }
    Err(ProtocolError::MismatchedResponse {
        command: command.get_text().to_string(),
        reply: messages
            .iter()
            .map(|m| format!("{m:02X?}"))
            .collect::<Vec<_>>()
            .join(" "),
    })
}
