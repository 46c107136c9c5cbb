//! Transport layer between the core and the CAN adapter
//!
//! The core only talks to [`Transport`]. There are two implementations:
//! - [`SerialTransport`]: SLCAN over a USB-serial adapter (production)
//! - [`ReplayTransport`]: deterministic frames for tests and offline replay

mod replay;
mod serial;

pub use replay::{FrameRecording, RecordedFrame, ReplayControl, ReplayTransport, Reply};
pub use serial::{list_ports, open_serial_link, AdapterConfig, LinkOpener, SerialLink, SerialTransport};

use crate::core::error::Result;
use crate::core::frame::CanFrame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Interval between byte-level polls of the link
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Kind of adapter behind a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterKind {
    /// SLCAN USB-serial adapter
    Slcan,
    /// Replayed or synthesized frames
    Replay,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slcan => write!(f, "SLCAN"),
            Self::Replay => write!(f, "Replay"),
        }
    }
}

/// What the adapter reported while opening
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    /// Adapter kind
    pub kind: AdapterKind,
    /// Hardware version digits
    pub hardware_version: String,
    /// Firmware version digits
    pub firmware_version: String,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} adapter (hw {}, fw {})",
            self.kind, self.hardware_version, self.firmware_version
        )
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    /// Frames written
    pub frames_sent: u64,
    /// Frames received
    pub frames_received: u64,
    /// Bytes written to the link
    pub bytes_sent: u64,
    /// Bytes read from the link
    pub bytes_received: u64,
    /// Frames the adapter refused
    pub naks: u64,
    /// Malformed lines and link errors
    pub errors: u64,
    /// Seconds since open
    pub uptime_secs: u64,
}

/// Frame-level link to the CAN bus
///
/// All operations are bounded by their timeout. A receive timeout is not an
/// error: it yields `Ok(None)`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send {
    /// Open the link and bring the CAN channel up
    async fn open(&mut self) -> Result<AdapterInfo>;

    /// Send one frame and wait for the adapter's acknowledgement.
    ///
    /// A rejection fails immediately; retrying is the caller's decision.
    async fn send(&mut self, frame: &CanFrame, timeout: Duration) -> Result<()>;

    /// Receive the next frame, or `None` when the timeout elapses first
    async fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>>;

    /// Close the link. Closing a closed transport is a no-op.
    async fn close(&mut self) -> Result<()>;

    /// Check if the link is open
    fn is_open(&self) -> bool;

    /// Adapter kind
    fn kind(&self) -> AdapterKind;

    /// Human readable description of the link
    fn describe(&self) -> String;

    /// Statistics since the last open
    fn stats(&self) -> TransportStats;
}
