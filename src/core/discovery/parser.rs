//! Element table parser
//!
//! The controller's table is a run of records, each an 18-byte big-endian
//! header followed by the element name:
//!
//! ```text
//! +-------+-----------+--------+--------+----------+------------------+
//! | index | extid     | max    | min    | name_len | name (Latin-1)   |
//! | u16   | 7 bytes   | i32    | i32    | u8       | name_len bytes   |
//! +-------+-----------+--------+--------+----------+------------------+
//! ```

use crate::core::frame::{request_id, response_id};
use std::fmt;
use tracing::debug;

/// Size of one record header
pub const HEADER_LEN: usize = 18;

/// Size of the extended identifier field
pub const EXTID_LEN: usize = 7;

/// One parameter of the controller's table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredElement {
    /// Element index
    pub index: u16,
    /// Extended identifier as reported by the controller
    pub extid: [u8; EXTID_LEN],
    /// Upper bound
    pub max: i32,
    /// Lower bound
    pub min: i32,
    /// Parameter name
    pub name: String,
}

impl DiscoveredElement {
    /// Identifier of the read request for this element
    pub fn request_id(&self) -> u32 {
        request_id(self.index)
    }

    /// Identifier of responses and writes for this element
    pub fn response_id(&self) -> u32 {
        response_id(self.index)
    }

    /// Extended identifier as upper-case hex
    pub fn extid_hex(&self) -> String {
        hex::encode_upper(self.extid)
    }

    /// Encode as a table record
    pub fn to_bytes(&self) -> Vec<u8> {
        let name: Vec<u8> = self
            .name
            .chars()
            .take(usize::from(u8::MAX))
            .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
            .collect();
        let mut out = Vec::with_capacity(HEADER_LEN + name.len());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.extid);
        out.extend_from_slice(&self.max.to_be_bytes());
        out.extend_from_slice(&self.min.to_be_bytes());
        out.push(name.len() as u8);
        out.extend_from_slice(&name);
        out
    }
}

impl fmt::Display for DiscoveredElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<24} idx {:>4} id {:08X} [{}..{}]",
            self.name,
            self.index,
            self.response_id(),
            self.min,
            self.max
        )
    }
}

fn be_i32(bytes: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    i32::from_be_bytes(buf)
}

/// Parse a record at the start of `buf`.
///
/// Returns the element and the bytes consumed, or `None` when the record is
/// truncated.
pub fn parse_element(buf: &[u8]) -> Option<(DiscoveredElement, usize)> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let name_len = usize::from(buf[HEADER_LEN - 1]);
    let total = HEADER_LEN + name_len;
    if buf.len() < total {
        return None;
    }

    let mut extid = [0u8; EXTID_LEN];
    extid.copy_from_slice(&buf[2..2 + EXTID_LEN]);
    // Latin-1 maps every byte to the code point of the same value
    let name: String = buf[HEADER_LEN..total]
        .iter()
        .map(|&b| char::from(b))
        .collect::<String>()
        .trim_end_matches('\0')
        .to_string();

    let element = DiscoveredElement {
        index: u16::from_be_bytes([buf[0], buf[1]]),
        extid,
        max: be_i32(&buf[9..13]),
        min: be_i32(&buf[13..17]),
        name,
    };
    Some((element, total))
}

/// Parse a whole table buffer.
///
/// A truncated trailing record (short transfer) is dropped.
pub fn parse_table(buf: &[u8]) -> Vec<DiscoveredElement> {
    let mut elements = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        match parse_element(&buf[offset..]) {
            Some((element, used)) => {
                elements.push(element);
                offset += used;
            }
            None => {
                debug!(offset, remaining = buf.len() - offset, "dropping truncated element record");
                break;
            }
        }
    }
    elements
}

/// Encode elements back into a table buffer
pub fn encode_table(elements: &[DiscoveredElement]) -> Vec<u8> {
    elements.iter().flat_map(DiscoveredElement::to_bytes).collect()
}
