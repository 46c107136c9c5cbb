//! CAN frame type
//!
//! Frames are immutable once built. The constructors enforce the invariants
//! the adapter relies on: at most 8 payload bytes, no payload on remote
//! frames, and an identifier inside the range of its format.

use super::codec::FrameError;
use std::fmt;

/// Largest standard (11-bit) identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest extended (29-bit) identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Largest payload a classic CAN frame carries
pub const MAX_PAYLOAD: usize = 8;

/// A classic CAN 2.0 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    data: Vec<u8>,
    extended: bool,
    remote: bool,
    timestamp_ms: Option<u16>,
}

impl CanFrame {
    /// Build a data frame with a standard identifier
    pub fn new(id: u32, data: &[u8]) -> Result<Self, FrameError> {
        Self::build(id, data, false, false)
    }

    /// Build a data frame with an extended identifier
    pub fn new_extended(id: u32, data: &[u8]) -> Result<Self, FrameError> {
        Self::build(id, data, true, false)
    }

    /// Build a remote transmission request
    pub fn new_remote(id: u32, extended: bool) -> Result<Self, FrameError> {
        Self::build(id, &[], extended, true)
    }

    fn build(id: u32, data: &[u8], extended: bool, remote: bool) -> Result<Self, FrameError> {
        let max_id = if extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
        if id > max_id {
            return Err(FrameError::IdOutOfRange { id, extended });
        }
        if data.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong(data.len()));
        }
        if remote && !data.is_empty() {
            return Err(FrameError::RemoteWithPayload);
        }
        Ok(Self {
            id,
            data: data.to_vec(),
            extended,
            remote,
            timestamp_ms: None,
        })
    }

    /// Attach the adapter's reception timestamp
    #[must_use]
    pub fn with_timestamp(mut self, timestamp_ms: u16) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Arbitration identifier
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload length (DLC)
    pub fn dlc(&self) -> usize {
        self.data.len()
    }

    /// True for 29-bit identifiers
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// True for remote transmission requests
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Adapter timestamp in milliseconds, when the adapter supplies one
    pub fn timestamp_ms(&self) -> Option<u16> {
        self.timestamp_ms
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:03X}", self.id)?;
        }
        if self.remote {
            return write!(f, " RTR");
        }
        write!(f, " [{}]", self.data.len())?;
        for byte in &self.data {
            write!(f, " {byte:02X}")?;
        }
        Ok(())
    }
}

// Controller identifier layout: the element index sits in bits 14..=25.

/// Base of read requests (RTR)
pub const READ_REQUEST_BASE: u32 = 0x0400_3FE0;

/// Base of read responses, writes and value broadcasts
pub const RESPONSE_BASE: u32 = 0x0C00_3FE0;

/// First bit of the element index
pub const INDEX_SHIFT: u32 = 14;

/// Largest index the identifier layout can carry
pub const MAX_INDEX: u16 = 0x0FFF;

const INDEX_MASK: u32 = (MAX_INDEX as u32) << INDEX_SHIFT;

/// Identifier of the read request for an element
pub fn request_id(index: u16) -> u32 {
    READ_REQUEST_BASE | (u32::from(index & MAX_INDEX) << INDEX_SHIFT)
}

/// Identifier of the response to, or write of, an element
pub fn response_id(index: u16) -> u32 {
    RESPONSE_BASE | (u32::from(index & MAX_INDEX) << INDEX_SHIFT)
}

/// Split an identifier into its base and element index
pub fn split_id(id: u32) -> (u32, u16) {
    (id & !INDEX_MASK, ((id & INDEX_MASK) >> INDEX_SHIFT) as u16)
}
