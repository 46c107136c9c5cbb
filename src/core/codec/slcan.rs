//! SLCAN (LAWICEL) line codec
//!
//! Every frame travels as one ASCII line terminated by `\r`:
//!
//! ```text
//! t iii L dd..      standard data frame
//! T iiiiiiii L dd.. extended data frame
//! r iii L           standard remote request
//! R iiiiiiii L      extended remote request
//! ```
//!
//! Received lines may end with four extra hex digits, the adapter's
//! millisecond timestamp. Decoding is strict: any field of the wrong width or
//! a length digit that disagrees with the payload fails with [`FrameError`].

use crate::core::frame::{CanFrame, MAX_PAYLOAD};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Line terminator and positive acknowledgement
pub const CR: u8 = b'\r';

/// Negative acknowledgement (bell)
pub const BELL: u8 = 0x07;

const STANDARD_ID_DIGITS: usize = 3;
const EXTENDED_ID_DIGITS: usize = 8;
const TIMESTAMP_DIGITS: usize = 4;

/// Longest valid line: `T`, 8 id digits, length, 16 payload digits, timestamp and `\r`
pub const MAX_LINE_LEN: usize = 1 + EXTENDED_ID_DIGITS + 1 + 2 * MAX_PAYLOAD + TIMESTAMP_DIGITS + 1;

/// Status flag: bus error (reported as bus-off)
pub const STATUS_BUS_ERROR: u8 = 0x80;

/// Status flag: error passive
pub const STATUS_ERROR_PASSIVE: u8 = 0x20;

/// Malformed frame or line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Empty line
    #[error("empty line")]
    Empty,

    /// Unknown frame type character
    #[error("unknown frame type '{0}'")]
    UnknownType(char),

    /// Identifier field has the wrong number of digits
    #[error("identifier needs {expected} hex digits, line has {found}")]
    IdWidth {
        /// Digits required by the frame type
        expected: usize,
        /// Digits available
        found: usize,
    },

    /// Identifier outside the range allowed by its format
    #[error("identifier {id:#X} out of range (extended: {extended})")]
    IdOutOfRange {
        /// Offending identifier
        id: u32,
        /// Whether the frame was extended
        extended: bool,
    },

    /// Invalid hex digits
    #[error("invalid hex in {0:?}")]
    InvalidHex(String),

    /// Odd number of payload hex digits
    #[error("odd-length hex payload ({0} digits)")]
    OddHex(usize),

    /// Length digit is not 0-8
    #[error("invalid length digit '{0}'")]
    InvalidDlc(char),

    /// Length digit disagrees with payload size
    #[error("length digit says {dlc} bytes, payload has {actual}")]
    LengthMismatch {
        /// Declared length
        dlc: usize,
        /// Bytes present
        actual: usize,
    },

    /// Payload longer than 8 bytes
    #[error("payload of {0} bytes exceeds 8")]
    PayloadTooLong(usize),

    /// Remote frames carry no payload
    #[error("remote frame with payload")]
    RemoteWithPayload,

    /// Bytes kept arriving without a terminator; they were discarded
    #[error("no terminator within a frame length ({0} bytes dropped)")]
    LineTooLong(usize),
}

/// CAN bus bitrate, selected with the `S<n>` command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bitrate {
    /// 10 kbit/s
    #[serde(rename = "10k")]
    K10,
    /// 20 kbit/s
    #[serde(rename = "20k")]
    K20,
    /// 50 kbit/s
    #[serde(rename = "50k")]
    K50,
    /// 100 kbit/s
    #[serde(rename = "100k")]
    K100,
    /// 125 kbit/s
    #[default]
    #[serde(rename = "125k")]
    K125,
    /// 250 kbit/s
    #[serde(rename = "250k")]
    K250,
    /// 500 kbit/s
    #[serde(rename = "500k")]
    K500,
    /// 800 kbit/s
    #[serde(rename = "800k")]
    K800,
    /// 1 Mbit/s
    #[serde(rename = "1m")]
    M1,
}

impl Bitrate {
    /// Digit used in the `S<n>` command
    pub fn code(self) -> u8 {
        match self {
            Self::K10 => 0,
            Self::K20 => 1,
            Self::K50 => 2,
            Self::K100 => 3,
            Self::K125 => 4,
            Self::K250 => 5,
            Self::K500 => 6,
            Self::K800 => 7,
            Self::M1 => 8,
        }
    }

    /// The `S<n>` command for this bitrate
    pub fn command(self) -> String {
        format!("S{}", self.code())
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::K10 => "10 kbit/s",
            Self::K20 => "20 kbit/s",
            Self::K50 => "50 kbit/s",
            Self::K100 => "100 kbit/s",
            Self::K125 => "125 kbit/s",
            Self::K250 => "250 kbit/s",
            Self::K500 => "500 kbit/s",
            Self::K800 => "800 kbit/s",
            Self::M1 => "1 Mbit/s",
        };
        f.write_str(text)
    }
}

/// Encode a frame as an SLCAN line, including the trailing `\r`
pub fn encode(frame: &CanFrame) -> String {
    let kind = match (frame.is_extended(), frame.is_remote()) {
        (false, false) => 't',
        (true, false) => 'T',
        (false, true) => 'r',
        (true, true) => 'R',
    };

    let mut line = String::with_capacity(1 + EXTENDED_ID_DIGITS + 1 + MAX_PAYLOAD * 2 + 1);
    line.push(kind);
    if frame.is_extended() {
        line.push_str(&format!("{:08X}", frame.id()));
    } else {
        line.push_str(&format!("{:03X}", frame.id()));
    }
    line.push_str(&frame.dlc().to_string());
    line.push_str(&hex::encode_upper(frame.data()));
    line.push(CR as char);
    line
}

/// Decode one SLCAN frame line; a trailing `\r` is optional
pub fn decode(line: &str) -> Result<CanFrame, FrameError> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let mut chars = line.chars();
    let kind = chars.next().ok_or(FrameError::Empty)?;
    let (extended, remote) = match kind {
        't' => (false, false),
        'T' => (true, false),
        'r' => (false, true),
        'R' => (true, true),
        other => return Err(FrameError::UnknownType(other)),
    };

    if !line.is_ascii() {
        return Err(FrameError::InvalidHex(line.to_string()));
    }
    let body = &line[1..];
    let id_digits = if extended { EXTENDED_ID_DIGITS } else { STANDARD_ID_DIGITS };
    if body.len() < id_digits + 1 {
        return Err(FrameError::IdWidth {
            expected: id_digits,
            found: body.len().min(id_digits),
        });
    }
    let id_text = &body[..id_digits];
    if !id_text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(FrameError::InvalidHex(id_text.to_string()));
    }
    let id = u32::from_str_radix(id_text, 16)
        .map_err(|_| FrameError::InvalidHex(id_text.to_string()))?;

    let dlc_char = body[id_digits..]
        .chars()
        .next()
        .ok_or(FrameError::InvalidDlc(' '))?;
    let dlc = dlc_char
        .to_digit(10)
        .map(|d| d as usize)
        .filter(|&d| d <= MAX_PAYLOAD)
        .ok_or(FrameError::InvalidDlc(dlc_char))?;

    let rest = &body[id_digits + 1..];
    let (payload_hex, timestamp_hex) = split_timestamp(rest, if remote { 0 } else { dlc * 2 })?;

    let data = hex::decode(payload_hex).map_err(|_| FrameError::InvalidHex(payload_hex.to_string()))?;
    let frame = if remote {
        CanFrame::new_remote(id, extended)?
    } else if extended {
        CanFrame::new_extended(id, &data)?
    } else {
        CanFrame::new(id, &data)?
    };

    match timestamp_hex {
        Some(ts) => {
            let ts = hex_field(ts)
                .and_then(|v| u16::try_from(v).ok())
                .ok_or_else(|| FrameError::InvalidHex(ts.to_string()))?;
            Ok(frame.with_timestamp(ts))
        }
        None => Ok(frame),
    }
}

/// Parse a field made only of hex digits; `from_str_radix` alone takes a sign
fn hex_field(text: &str) -> Option<u32> {
    if text.is_empty() || text.len() > 8 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(text, 16).ok()
}

/// Split the payload digits from an optional trailing timestamp
fn split_timestamp(rest: &str, payload_digits: usize) -> Result<(&str, Option<&str>), FrameError> {
    if rest.len() == payload_digits {
        return Ok((rest, None));
    }
    if rest.len() == payload_digits + TIMESTAMP_DIGITS {
        return Ok((&rest[..payload_digits], Some(&rest[payload_digits..])));
    }
    if rest.len() % 2 == 1 {
        return Err(FrameError::OddHex(rest.len()));
    }
    Err(FrameError::LengthMismatch {
        dlc: payload_digits / 2,
        actual: rest.len() / 2,
    })
}

/// Build an adapter command line (`"O"` becomes `b"O\r"`)
pub fn command(cmd: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(cmd.len() + 1);
    bytes.extend_from_slice(cmd.as_bytes());
    bytes.push(CR);
    bytes
}

/// One complete unit read from the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterLine {
    /// A received CAN frame
    Frame(CanFrame),
    /// Positive acknowledgement (`\r`, `z\r` or `Z\r`)
    Ack,
    /// Negative acknowledgement (bell)
    Nak,
    /// Version reply `Vhhff`
    Version {
        /// Hardware version digits
        hardware: String,
        /// Firmware version digits
        firmware: String,
    },
    /// Status flags reply `Fxx`
    Status(u8),
    /// Anything else the adapter printed
    Other(String),
}

/// Classify a line assembled by the transport (without its terminator)
pub fn parse_line(line: &str) -> Result<AdapterLine, FrameError> {
    if !line.is_ascii() {
        return Ok(AdapterLine::Other(line.to_string()));
    }
    match line.chars().next() {
        None => Ok(AdapterLine::Ack),
        Some('z' | 'Z') if line.len() == 1 => Ok(AdapterLine::Ack),
        Some('t' | 'T' | 'r' | 'R') => decode(line).map(AdapterLine::Frame),
        Some('V') if line.len() == 5 => Ok(AdapterLine::Version {
            hardware: line[1..3].to_string(),
            firmware: line[3..5].to_string(),
        }),
        Some('F') if line.len() == 3 => hex_field(&line[1..])
            .and_then(|v| u8::try_from(v).ok())
            .map(AdapterLine::Status)
            .ok_or_else(|| FrameError::InvalidHex(line[1..].to_string())),
        Some(_) => Ok(AdapterLine::Other(line.to_string())),
    }
}
