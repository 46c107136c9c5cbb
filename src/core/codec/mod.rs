//! Codecs for the adapter's wire format and for parameter values
//!
//! - `slcan`: CAN frames to/from the adapter's ASCII line protocol
//! - `value`: temperatures and big-endian integers to/from payload bytes

pub mod slcan;
pub mod value;

pub use slcan::{AdapterLine, Bitrate, FrameError, MAX_LINE_LEN};
pub use value::{CodecError, Value, ValueFormat};

/// Format bytes as compact uppercase hex ("0123AB")
pub fn to_hex(data: &[u8]) -> String {
    hex::encode_upper(data)
}

/// Parse a hex string into bytes, accepting either case and embedded spaces
pub fn from_hex(text: &str) -> Result<Vec<u8>, CodecError> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let cleaned = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
        .unwrap_or(&cleaned);
    hex::decode(cleaned).map_err(|e| CodecError::InvalidHex(e.to_string()))
}
