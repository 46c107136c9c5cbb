//! Error taxonomy
//!
//! Each failure family has its own enum so callers can match on the kind of
//! problem; [`Error`] folds them together for `?` propagation.

use super::codec::{CodecError, FrameError};
use std::time::Duration;
use thiserror::Error;

/// Crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// Link-level failures, fatal to the current connect attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Serial device does not exist (unplugged or wrong name)
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Device exists but cannot be opened
    #[error("permission denied on {0} (port likely in use by another process)")]
    PermissionDenied(String),

    /// Link dropped while in use, or not open at all
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Adapter rejected or ignored a step of its init sequence
    #[error("adapter initialization failed at '{step}': {reason}")]
    InitializationFailed {
        /// Command that failed
        step: String,
        /// What the adapter did instead of acknowledging
        reason: String,
    },
}

/// Per-call timeouts
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    /// No complete response within the timeout
    #[error("read timed out after {0:?}")]
    Read(Duration),

    /// No acknowledgement for a write within the timeout
    #[error("write timed out after {0:?}")]
    Write(Duration),
}

/// CAN bus level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CanError {
    /// Controller went bus-off; the channel has been closed
    #[error("CAN bus-off (status {0:#04X})")]
    BusOff(u8),

    /// Persistent error-passive state, usually a bitrate mismatch
    #[error("CAN bitrate mismatch suspected (status {0:#04X})")]
    BitrateMismatch(u8),

    /// Adapter answered with a line that is not a valid frame
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    /// Adapter refused the frame (bell)
    #[error("frame rejected by adapter")]
    Rejected,
}

/// Overlapping operation on one connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("connection busy: another operation is in flight")]
pub struct ConcurrencyError;

/// Element discovery failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// One attempt delivered fewer bytes than the completeness threshold
    #[error("incomplete element table on attempt {attempt}: {received}/{expected} bytes")]
    Incomplete {
        /// Attempt number, starting at 1
        attempt: u32,
        /// Bytes received
        received: usize,
        /// Bytes the controller reported
        expected: usize,
    },

    /// Every attempt failed and no usable cache exists
    #[error(
        "element discovery failed after {attempts} attempts \
         (best {received}/{expected} bytes) and no valid cache exists"
    )]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Best byte count seen
        received: usize,
        /// Bytes the controller reported
        expected: usize,
    },

    /// Controller reported an unusable table length
    #[error("controller reported invalid element table length {0}")]
    InvalidLength(u32),

    /// Table length reply did not carry four bytes
    #[error("malformed table length reply ({0} bytes)")]
    LengthReply(usize),

    /// Cache file could not be read or written
    #[error("discovery cache: {0}")]
    Cache(String),
}

/// Any failure surfaced by the core
#[derive(Error, Debug)]
pub enum Error {
    /// Link failure
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Timeout
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// CAN failure
    #[error(transparent)]
    Can(#[from] CanError),

    /// Overlapping operation
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// Discovery failure
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Value codec failure
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Parameter is not in the element registry
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    /// Direct reply unusable and no broadcast value was observed either
    #[error("no usable value for {name}: {reason}")]
    NoValue {
        /// Parameter name
        name: String,
        /// Why neither path produced a value
        reason: String,
    },

    /// File system error (cache, recordings)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for Error {
    fn from(err: FrameError) -> Self {
        Self::Can(CanError::MalformedFrame(err))
    }
}

impl Error {
    /// True when the physical link is gone and reconnection should start
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Connection(ConnectionError::Disconnected(_) | ConnectionError::DeviceNotFound(_))
                | Self::Can(CanError::BusOff(_))
        )
    }

    /// True for overlapping-operation errors
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Concurrency(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_failure_classification() {
        assert!(Error::from(ConnectionError::Disconnected("unplugged".into())).is_link_failure());
        assert!(Error::from(CanError::BusOff(0x80)).is_link_failure());
        assert!(!Error::from(CanError::Rejected).is_link_failure());
        assert!(!Error::from(TimeoutError::Read(Duration::from_secs(1))).is_link_failure());
        assert!(Error::from(ConcurrencyError).is_busy());
    }

    #[test]
    fn test_frame_error_becomes_can_error() {
        let err = Error::from(FrameError::Empty);
        assert!(matches!(err, Error::Can(CanError::MalformedFrame(FrameError::Empty))));
    }

    #[test]
    fn test_permission_message_mentions_other_process() {
        let msg = ConnectionError::PermissionDenied("/dev/ttyACM0".into()).to_string();
        assert!(msg.contains("in use by another process"));
    }
}
