//! Parameter value encodings
//!
//! The controller stores temperatures in three fixed-point layouts and
//! everything else as big-endian integers of 1, 2, 4 or 8 bytes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Value codec errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Byte count does not match the format
    #[error("{format} needs {expected} bytes, got {actual}")]
    Length {
        /// Format being decoded
        format: ValueFormat,
        /// Bytes the format requires
        expected: usize,
        /// Bytes supplied
        actual: usize,
    },

    /// Value cannot be represented in the format
    #[error("{value} does not fit {format}")]
    OutOfRange {
        /// Format being encoded
        format: ValueFormat,
        /// Offending value
        value: String,
    },

    /// Value kind does not match the format (e.g. a temperature for an integer)
    #[error("value {value} cannot be encoded as {format}")]
    KindMismatch {
        /// Format being encoded
        format: ValueFormat,
        /// Offending value
        value: String,
    },

    /// Integer width other than 1, 2, 4 or 8
    #[error("unsupported integer width {0}")]
    Width(usize),

    /// Invalid hex text
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

/// Layout of a parameter's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueFormat {
    /// Signed 16-bit, 0.1 degree steps
    Temp,
    /// Unsigned 8-bit, 0.5 degree steps
    TempHalf,
    /// Unsigned 8-bit, whole degrees
    TempWhole,
    /// Signed integer of 1, 2, 4 or 8 bytes
    Int(u8),
    /// Unsigned integer of 1, 2, 4 or 8 bytes
    UInt(u8),
}

impl ValueFormat {
    /// Exact payload length this format occupies
    pub fn byte_len(self) -> usize {
        match self {
            Self::Temp => 2,
            Self::TempHalf | Self::TempWhole => 1,
            Self::Int(width) | Self::UInt(width) => width as usize,
        }
    }

    /// True for the three temperature layouts
    pub fn is_temperature(self) -> bool {
        matches!(self, Self::Temp | Self::TempHalf | Self::TempWhole)
    }

    /// True when a direct reply has the shape this format needs.
    ///
    /// The adapter sometimes answers with a truncated acknowledgement
    /// (typically one byte for a two-byte value); such replies fail here.
    pub fn accepts(self, payload: &[u8]) -> bool {
        payload.len() == self.byte_len()
    }

    /// Decode a payload
    pub fn decode(self, payload: &[u8]) -> Result<Value, CodecError> {
        self.check_len(payload)?;
        match self {
            Self::Temp | Self::TempHalf | Self::TempWhole => {
                decode_temperature(payload, self).map(Value::Temperature)
            }
            Self::Int(_) => decode_signed(payload).map(Value::Signed),
            Self::UInt(_) => decode_unsigned(payload).map(Value::Unsigned),
        }
    }

    /// Encode a value
    pub fn encode(self, value: &Value) -> Result<Vec<u8>, CodecError> {
        match (self, value) {
            (Self::Temp | Self::TempHalf | Self::TempWhole, Value::Temperature(v)) => {
                encode_temperature(*v, self)
            }
            (Self::Temp | Self::TempHalf | Self::TempWhole, Value::Signed(v)) => {
                encode_temperature(*v as f64, self)
            }
            (Self::Int(width), Value::Signed(v)) => encode_signed(*v, width as usize),
            (Self::UInt(width), Value::Unsigned(v)) => encode_unsigned(*v, width as usize),
            (Self::UInt(width), Value::Signed(v)) if *v >= 0 => {
                encode_unsigned(*v as u64, width as usize)
            }
            _ => Err(CodecError::KindMismatch {
                format: self,
                value: value.to_string(),
            }),
        }
    }

    fn check_len(self, payload: &[u8]) -> Result<(), CodecError> {
        if self.accepts(payload) {
            Ok(())
        } else {
            Err(CodecError::Length {
                format: self,
                expected: self.byte_len(),
                actual: payload.len(),
            })
        }
    }
}

impl fmt::Display for ValueFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temp => write!(f, "temperature (0.1)"),
            Self::TempHalf => write!(f, "temperature (0.5)"),
            Self::TempWhole => write!(f, "temperature (1)"),
            Self::Int(width) => write!(f, "i{}", u32::from(*width) * 8),
            Self::UInt(width) => write!(f, "u{}", u32::from(*width) * 8),
        }
    }
}

impl std::str::FromStr for ValueFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "temp" | "tem" => Ok(Self::Temp),
            "temp_half" | "half" => Ok(Self::TempHalf),
            "temp_whole" | "whole" => Ok(Self::TempWhole),
            "i8" => Ok(Self::Int(1)),
            "i16" => Ok(Self::Int(2)),
            "i32" => Ok(Self::Int(4)),
            "i64" => Ok(Self::Int(8)),
            "u8" => Ok(Self::UInt(1)),
            "u16" => Ok(Self::UInt(2)),
            "u32" => Ok(Self::UInt(4)),
            "u64" => Ok(Self::UInt(8)),
            other => Err(format!("unknown value format: {other}")),
        }
    }
}

/// A decoded parameter value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Degrees Celsius
    Temperature(f64),
    /// Signed integer
    Signed(i64),
    /// Unsigned integer
    Unsigned(u64),
}

impl Value {
    /// Numeric value as f64
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Temperature(v) => *v,
            Self::Signed(v) => *v as f64,
            Self::Unsigned(v) => *v as f64,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temperature(v) => write!(f, "{v:.1}"),
            Self::Signed(v) => write!(f, "{v}"),
            Self::Unsigned(v) => write!(f, "{v}"),
        }
    }
}

/// Encode degrees Celsius in one of the temperature layouts
pub fn encode_temperature(value: f64, format: ValueFormat) -> Result<Vec<u8>, CodecError> {
    let out_of_range = || CodecError::OutOfRange {
        format,
        value: value.to_string(),
    };
    if !value.is_finite() {
        return Err(out_of_range());
    }
    match format {
        ValueFormat::Temp => {
            let raw = (value * 10.0).round();
            if raw < f64::from(i16::MIN) || raw > f64::from(i16::MAX) {
                return Err(out_of_range());
            }
            Ok((raw as i16).to_be_bytes().to_vec())
        }
        ValueFormat::TempHalf | ValueFormat::TempWhole => {
            let steps = if format == ValueFormat::TempHalf { 2.0 } else { 1.0 };
            let raw = (value * steps).round();
            if !(0.0..=255.0).contains(&raw) {
                return Err(out_of_range());
            }
            Ok(vec![raw as u8])
        }
        ValueFormat::Int(_) | ValueFormat::UInt(_) => Err(CodecError::KindMismatch {
            format,
            value: value.to_string(),
        }),
    }
}

/// Decode one of the temperature layouts into degrees Celsius
pub fn decode_temperature(payload: &[u8], format: ValueFormat) -> Result<f64, CodecError> {
    format.check_len(payload)?;
    match format {
        ValueFormat::Temp => Ok(f64::from(i16::from_be_bytes([payload[0], payload[1]])) / 10.0),
        ValueFormat::TempHalf => Ok(f64::from(payload[0]) / 2.0),
        ValueFormat::TempWhole => Ok(f64::from(payload[0])),
        ValueFormat::Int(_) | ValueFormat::UInt(_) => Err(CodecError::KindMismatch {
            format,
            value: crate::core::codec::to_hex(payload),
        }),
    }
}

fn check_width(width: usize) -> Result<(), CodecError> {
    match width {
        1 | 2 | 4 | 8 => Ok(()),
        other => Err(CodecError::Width(other)),
    }
}

/// Encode a signed integer big-endian in `width` bytes
pub fn encode_signed(value: i64, width: usize) -> Result<Vec<u8>, CodecError> {
    check_width(width)?;
    let bits = width * 8;
    if bits < 64 {
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if value < min || value > max {
            return Err(CodecError::OutOfRange {
                format: ValueFormat::Int(width as u8),
                value: value.to_string(),
            });
        }
    }
    Ok(value.to_be_bytes()[8 - width..].to_vec())
}

/// Encode an unsigned integer big-endian in `width` bytes
pub fn encode_unsigned(value: u64, width: usize) -> Result<Vec<u8>, CodecError> {
    check_width(width)?;
    let bits = width * 8;
    if bits < 64 && value >= (1u64 << bits) {
        return Err(CodecError::OutOfRange {
            format: ValueFormat::UInt(width as u8),
            value: value.to_string(),
        });
    }
    Ok(value.to_be_bytes()[8 - width..].to_vec())
}

/// Decode a big-endian signed integer of 1, 2, 4 or 8 bytes
pub fn decode_signed(payload: &[u8]) -> Result<i64, CodecError> {
    check_width(payload.len())?;
    let fill = if payload[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut buf = [fill; 8];
    buf[8 - payload.len()..].copy_from_slice(payload);
    Ok(i64::from_be_bytes(buf))
}

/// Decode a big-endian unsigned integer of 1, 2, 4 or 8 bytes
pub fn decode_unsigned(payload: &[u8]) -> Result<u64, CodecError> {
    check_width(payload.len())?;
    let mut buf = [0u8; 8];
    buf[8 - payload.len()..].copy_from_slice(payload);
    Ok(u64::from_be_bytes(buf))
}
