//! Fixed-size binary framing between the client and the runner.
//!
//! ```text
//! request  (128 bytes): [opcode u8][filter u8][cycle u8][date 15 bytes][reserved 110 bytes]
//! response (105 bytes): [error code u8][intensity i32 LE][message 100 bytes, zero padded]
//! ```
//!
//! Only `STATUS` requests are answered. There is no implicit padding in the
//! response; the intensity follows the code byte directly.

use bytes::{Buf, BufMut};
use std::fmt;

use crate::error::ErrorCode;

/// Size of every request frame.
pub const REQUEST_LEN: usize = 128;
/// Size of every response frame.
pub const RESPONSE_LEN: usize = 105;
/// Width of the experiment-date field.
pub const DATE_LEN: usize = 15;
/// Width of the error-message field.
pub const MESSAGE_LEN: usize = 100;
/// Intensity reported when no reading is available.
pub const NO_INTENSITY: i32 = -1;

const RESERVED_LEN: usize = REQUEST_LEN - 3 - DATE_LEN;

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Report fault state and the latest intensity.
    Status = 0x00,
    /// Start an acquisition.
    Shot = 0x01,
    /// Indicator off.
    Off = 0x02,
    /// Indicator ready.
    Ready = 0x03,
    /// Indicator running.
    Run = 0x04,
    /// Indicator error.
    Error = 0x05,
    /// Stop the server.
    Exit = 0xFF,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x00 => Ok(Command::Status),
            0x01 => Ok(Command::Shot),
            0x02 => Ok(Command::Off),
            0x03 => Ok(Command::Ready),
            0x04 => Ok(Command::Run),
            0x05 => Ok(Command::Error),
            0xFF => Ok(Command::Exit),
            other => Err(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Status => "STATUS",
            Command::Shot => "SHOT",
            Command::Off => "OFF",
            Command::Ready => "READY",
            Command::Run => "RUN",
            Command::Error => "ERROR",
            Command::Exit => "EXIT",
        };
        f.write_str(name)
    }
}

/// A decoded request frame.
///
/// The opcode is kept raw so that unknown opcodes reach the dispatcher,
/// which reports them as a server fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Raw opcode byte
    pub opcode: u8,
    /// Fluorescence filter index (0..4)
    pub filter_index: u8,
    /// PCR cycle number
    pub cycle: u8,
    /// Experiment label, NUL/space padding removed
    pub experiment_date: String,
}

impl Request {
    /// Request with only an opcode set.
    pub fn new(command: Command) -> Self {
        Self {
            opcode: command as u8,
            filter_index: 0,
            cycle: 0,
            experiment_date: String::new(),
        }
    }

    /// `SHOT` request.
    pub fn shot(filter_index: u8, cycle: u8, experiment_date: &str) -> Self {
        Self {
            opcode: Command::Shot as u8,
            filter_index,
            cycle,
            experiment_date: experiment_date.to_string(),
        }
    }

    /// Typed opcode, or the raw byte if it is not defined.
    pub fn command(&self) -> Result<Command, u8> {
        Command::try_from(self.opcode)
    }

    /// Decode a request frame.
    pub fn decode(frame: &[u8; REQUEST_LEN]) -> Self {
        let mut buf = &frame[..];
        let opcode = buf.get_u8();
        let filter_index = buf.get_u8();
        let cycle = buf.get_u8();
        let experiment_date = decode_text(&buf[..DATE_LEN]);
        Self {
            opcode,
            filter_index,
            cycle,
            experiment_date,
        }
    }

    /// Encode into a request frame. The date is truncated to 15 bytes.
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut frame = [0u8; REQUEST_LEN];
        let mut buf = &mut frame[..];
        buf.put_u8(self.opcode);
        buf.put_u8(self.filter_index);
        buf.put_u8(self.cycle);
        put_padded(&mut buf, &self.experiment_date, DATE_LEN);
        buf.put_bytes(0, RESERVED_LEN);
        frame
    }
}

/// A `STATUS` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Current fault classification
    pub error_code: ErrorCode,
    /// Latest intensity or [`NO_INTENSITY`]
    pub intensity: i32,
    /// Current fault message, empty without a fault
    pub message: String,
}

impl Response {
    /// Encode into a response frame. The message is truncated to 100 bytes
    /// at a character boundary.
    pub fn encode(&self) -> [u8; RESPONSE_LEN] {
        let mut frame = [0u8; RESPONSE_LEN];
        let mut buf = &mut frame[..];
        buf.put_u8(self.error_code.as_u8());
        buf.put_i32_le(self.intensity);
        put_padded(&mut buf, &self.message, MESSAGE_LEN);
        frame
    }

    /// Decode a response frame.
    pub fn decode(frame: &[u8; RESPONSE_LEN]) -> Self {
        let mut buf = &frame[..];
        let error_code = ErrorCode::from_u8(buf.get_u8());
        let intensity = buf.get_i32_le();
        let message = decode_text(&buf[..MESSAGE_LEN]);
        Self {
            error_code,
            intensity,
            message,
        }
    }
}

/// Longest prefix of `text` that fits in `max` bytes without splitting a character.
fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn put_padded(buf: &mut &mut [u8], text: &str, width: usize) {
    let text = truncate_utf8(text, width);
    buf.put_slice(text.as_bytes());
    buf.put_bytes(0, width - text.len());
}

fn decode_text(field: &[u8]) -> String {
    String::from_utf8_lossy(field)
        .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}
