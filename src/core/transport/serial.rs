//! SLCAN transport over a serial port

use super::{AdapterInfo, AdapterKind, Transport, TransportStats, POLL_INTERVAL};
use crate::core::codec::slcan::{
    self, AdapterLine, Bitrate, FrameError, BELL, CR, MAX_LINE_LEN, STATUS_BUS_ERROR,
    STATUS_ERROR_PASSIVE,
};
use crate::core::error::{CanError, ConnectionError, Error, Result, TimeoutError};
use crate::core::frame::CanFrame;
use async_trait::async_trait;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// How long to wait for a reply to the flushing close commands
const FLUSH_WINDOW: Duration = Duration::from_millis(100);

/// Adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Port name (e.g., /dev/ttyACM0, COM3)
    pub port: String,
    /// Serial baud rate
    pub baud_rate: u32,
    /// CAN bus bitrate
    pub bitrate: Bitrate,
    /// Per-operation timeout
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl AdapterConfig {
    /// Create a configuration with the default bitrate and timeout
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            bitrate: Bitrate::default(),
            timeout: Duration::from_secs(2),
        }
    }

    /// Set the CAN bitrate
    #[must_use]
    pub fn bitrate(mut self, bitrate: Bitrate) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Set the per-operation timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::new("/dev/ttyACM0", 115_200)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Byte-level link underneath the SLCAN transport
///
/// `read` returns `Ok(0)` (or a `TimedOut`/`WouldBlock` error) when no bytes
/// are available yet.
pub trait SerialLink: Send {
    /// Write all bytes and flush
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read whatever is available
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        Write::write_all(self, data)?;
        self.flush()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }
}

/// Opens the byte link for a configuration
pub type LinkOpener =
    Box<dyn Fn(&AdapterConfig) -> std::result::Result<Box<dyn SerialLink>, ConnectionError> + Send + Sync>;

/// Open a serial port with a short read timeout so the transport can poll it
pub fn open_serial_link(
    config: &AdapterConfig,
) -> std::result::Result<Box<dyn SerialLink>, ConnectionError> {
    let port = serialport::new(&config.port, config.baud_rate)
        .timeout(Duration::from_millis(1))
        .open()
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::NoDevice => ConnectionError::DeviceNotFound(config.port.clone()),
            serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
                ConnectionError::DeviceNotFound(config.port.clone())
            }
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
                ConnectionError::PermissionDenied(config.port.clone())
            }
            _ => ConnectionError::Disconnected(format!("{}: {e}", config.port)),
        })?;
    Ok(Box::new(port))
}

/// List available serial ports
pub fn list_ports() -> std::result::Result<Vec<serialport::SerialPortInfo>, ConnectionError> {
    serialport::available_ports().map_err(|e| ConnectionError::Disconnected(e.to_string()))
}

/// What an init step must get back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// Flush only: ack, bell or silence are all fine
    Flush,
    /// Version reply
    Version,
    /// Plain acknowledgement
    Ack,
}

/// SLCAN serial transport
pub struct SerialTransport {
    config: AdapterConfig,
    opener: LinkOpener,
    link: Option<Box<dyn SerialLink>>,
    rx: BytesMut,
    /// Dropping bytes up to the next terminator after an overlong line
    discarding: bool,
    pending: VecDeque<std::result::Result<CanFrame, FrameError>>,
    stats: TransportStats,
    opened_at: Option<Instant>,
}

impl SerialTransport {
    /// Create a transport for a serial port
    pub fn new(config: AdapterConfig) -> Self {
        Self::with_opener(config, Box::new(open_serial_link))
    }

    /// Create a transport with a custom link opener
    pub fn with_opener(config: AdapterConfig, opener: LinkOpener) -> Self {
        Self {
            config,
            opener,
            link: None,
            rx: BytesMut::with_capacity(256),
            discarding: false,
            pending: VecDeque::new(),
            stats: TransportStats::default(),
            opened_at: None,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| ConnectionError::Disconnected("transport not open".into()))?;
        trace!(line = %String::from_utf8_lossy(bytes).trim_end(), "tx");
        if let Err(e) = link.write_all(bytes) {
            return Err(self.link_lost(e));
        }
        self.stats.bytes_sent += bytes.len() as u64;
        Ok(())
    }

    fn link_lost(&mut self, err: io::Error) -> Error {
        warn!(port = %self.config.port, error = %err, "serial link lost");
        self.link = None;
        self.opened_at = None;
        self.stats.errors += 1;
        ConnectionError::Disconnected(format!("{}: {err}", self.config.port)).into()
    }

    /// Cut the next complete unit out of the receive buffer
    ///
    /// A line longer than any valid SLCAN line is dropped as a whole and
    /// reported once as [`FrameError::LineTooLong`].
    fn take_unit(&mut self) -> Option<std::result::Result<AdapterLine, FrameError>> {
        loop {
            let Some(pos) = self.rx.iter().position(|&b| b == CR || b == BELL) else {
                if self.rx.len() < MAX_LINE_LEN {
                    return None;
                }
                let dropped = self.rx.len();
                self.rx.clear();
                if self.discarding {
                    return None;
                }
                self.discarding = true;
                warn!(port = %self.config.port, dropped, "unterminated line overflow, discarding");
                return Some(Err(FrameError::LineTooLong(dropped)));
            };

            let unit = self.rx.split_to(pos + 1);
            if self.discarding {
                // tail of a line already reported
                self.discarding = false;
                continue;
            }
            if pos >= MAX_LINE_LEN {
                warn!(port = %self.config.port, dropped = unit.len(), "overlong line discarded");
                return Some(Err(FrameError::LineTooLong(unit.len())));
            }
            if unit[pos] == BELL {
                return Some(Ok(AdapterLine::Nak));
            }
            let text = String::from_utf8_lossy(&unit[..pos]).into_owned();
            trace!(line = %text, "rx");
            return Some(slcan::parse_line(&text));
        }
    }

    /// Read until one unit is complete or the deadline passes
    async fn next_unit(
        &mut self,
        deadline: Instant,
    ) -> Result<Option<std::result::Result<AdapterLine, FrameError>>> {
        let mut buf = [0u8; 256];
        loop {
            if let Some(unit) = self.take_unit() {
                return Ok(Some(unit));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let link = self
                .link
                .as_mut()
                .ok_or_else(|| ConnectionError::Disconnected("transport not open".into()))?;
            match link.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    self.rx.extend_from_slice(&buf[..n]);
                    self.stats.bytes_received += n as u64;
                    continue;
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
                Err(e) => return Err(self.link_lost(e)),
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// React to an `Fxx` status reply
    fn check_status(&mut self, flags: u8) -> Result<()> {
        if flags & STATUS_BUS_ERROR != 0 {
            warn!(port = %self.config.port, flags, "CAN bus-off, closing channel");
            let _ = self.write(&slcan::command("C"));
            self.stats.errors += 1;
            return Err(CanError::BusOff(flags).into());
        }
        if flags & STATUS_ERROR_PASSIVE != 0 {
            self.stats.errors += 1;
            return Err(CanError::BitrateMismatch(flags).into());
        }
        Ok(())
    }

    async fn init_step(&mut self, cmd: &str, expect: Expect) -> Result<Option<AdapterLine>> {
        self.write(&slcan::command(cmd))?;
        let window = if expect == Expect::Flush {
            FLUSH_WINDOW.min(self.config.timeout)
        } else {
            self.config.timeout
        };
        let deadline = Instant::now() + window;
        let failed = |reason: &str| -> Error {
            ConnectionError::InitializationFailed {
                step: cmd.to_string(),
                reason: reason.to_string(),
            }
            .into()
        };

        loop {
            let unit = match self.next_unit(deadline).await? {
                Some(unit) => unit,
                None if expect == Expect::Flush => return Ok(None),
                None => return Err(failed("no reply")),
            };
            match (expect, unit) {
                (Expect::Flush, Ok(AdapterLine::Ack | AdapterLine::Nak)) => return Ok(None),
                (Expect::Version, Ok(line @ AdapterLine::Version { .. })) => return Ok(Some(line)),
                (Expect::Ack, Ok(AdapterLine::Ack)) => return Ok(None),
                (Expect::Version | Expect::Ack, Ok(AdapterLine::Nak)) => {
                    return Err(failed("rejected"))
                }
                (_, other) => debug!(step = cmd, reply = ?other, "ignoring reply during init"),
            }
        }
    }

    async fn initialize(&mut self) -> Result<AdapterInfo> {
        self.init_step("C", Expect::Flush).await?;
        self.init_step("C", Expect::Flush).await?;
        self.rx.clear();

        let version = self.init_step("V", Expect::Version).await?;
        let (hardware_version, firmware_version) = match version {
            Some(AdapterLine::Version { hardware, firmware }) => (hardware, firmware),
            _ => (String::new(), String::new()),
        };

        let bitrate = self.config.bitrate.command();
        self.init_step(&bitrate, Expect::Ack).await?;
        self.init_step("O", Expect::Ack).await?;

        Ok(AdapterInfo {
            kind: AdapterKind::Slcan,
            hardware_version,
            firmware_version,
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<AdapterInfo> {
        self.close().await?;

        self.link = Some((self.opener)(&self.config)?);
        self.rx.clear();
        self.discarding = false;
        self.pending.clear();
        self.stats = TransportStats::default();

        match self.initialize().await {
            Ok(info) => {
                self.opened_at = Some(Instant::now());
                info!(
                    port = %self.config.port,
                    bitrate = %self.config.bitrate,
                    adapter = %info,
                    "CAN channel open"
                );
                Ok(info)
            }
            Err(e) => {
                self.link = None;
                Err(e)
            }
        }
    }

    async fn send(&mut self, frame: &CanFrame, timeout: Duration) -> Result<()> {
        self.write(slcan::encode(frame).as_bytes())?;
        self.stats.frames_sent += 1;

        let deadline = Instant::now() + timeout;
        loop {
            match self.next_unit(deadline).await? {
                None => return Err(TimeoutError::Write(timeout).into()),
                Some(Ok(AdapterLine::Ack)) => return Ok(()),
                Some(Ok(AdapterLine::Nak)) => {
                    self.stats.naks += 1;
                    debug!(frame = %frame, "adapter rejected frame");
                    return Err(CanError::Rejected.into());
                }
                Some(Ok(AdapterLine::Frame(rx))) => self.pending.push_back(Ok(rx)),
                Some(Ok(AdapterLine::Status(flags))) => self.check_status(flags)?,
                Some(Err(e)) => self.pending.push_back(Err(e)),
                Some(Ok(other)) => trace!(line = ?other, "ignored while awaiting ack"),
            }
        }
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        if let Some(queued) = self.pending.pop_front() {
            return match queued {
                Ok(frame) => {
                    self.stats.frames_received += 1;
                    Ok(Some(frame))
                }
                Err(e) => {
                    self.stats.errors += 1;
                    Err(e.into())
                }
            };
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.next_unit(deadline).await? {
                None => return Ok(None),
                Some(Ok(AdapterLine::Frame(frame))) => {
                    self.stats.frames_received += 1;
                    return Ok(Some(frame));
                }
                Some(Ok(AdapterLine::Status(flags))) => self.check_status(flags)?,
                Some(Err(e)) => {
                    self.stats.errors += 1;
                    return Err(e.into());
                }
                Some(Ok(other)) => trace!(line = ?other, "ignored while receiving"),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut link) = self.link.take() {
            let _ = link.write_all(&slcan::command("C"));
            info!(port = %self.config.port, "CAN channel closed");
        }
        self.opened_at = None;
        self.pending.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Slcan
    }

    fn describe(&self) -> String {
        format!(
            "{} @ {} baud, CAN {}",
            self.config.port, self.config.baud_rate, self.config.bitrate
        )
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.stats.clone();
        if let Some(opened_at) = self.opened_at {
            stats.uptime_secs = opened_at.elapsed().as_secs();
        }
        stats
    }
}
