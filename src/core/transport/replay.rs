//! Deterministic transport for tests and offline replay
//!
//! Frames come from three places:
//! - a responder closure that answers each sent frame
//! - an inbox of frames delivered on the next receive
//! - a schedule of frames due at fixed instants (broadcast traffic)
//!
//! Recordings of real bus traffic (JSON) can be loaded into the schedule.
//! A shared [`ReplayControl`] lets tests unplug the link, script open
//! failures and inspect what was sent.

use super::{AdapterInfo, AdapterKind, Transport, TransportStats};
use crate::core::codec::slcan;
use crate::core::error::{CanError, ConnectionError, Error, Result, TimeoutError};
use crate::core::frame::CanFrame;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How the replayed adapter answers a sent frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Acknowledge and queue these frames for receive
    Ack(Vec<CanFrame>),
    /// Reject the frame
    Nak,
    /// Never answer
    Silence,
}

type Responder = Box<dyn FnMut(&CanFrame) -> Reply + Send>;

struct ScheduledFrame {
    due: Instant,
    frame: CanFrame,
}

struct ReplayState {
    responder: Option<Responder>,
    inbox: VecDeque<CanFrame>,
    schedule: VecDeque<ScheduledFrame>,
    sent: Vec<CanFrame>,
    plugged: bool,
    open_failures: VecDeque<ConnectionError>,
    open_attempts: u32,
    open_delay: Duration,
}

impl Default for ReplayState {
    fn default() -> Self {
        Self {
            responder: None,
            inbox: VecDeque::new(),
            schedule: VecDeque::new(),
            sent: Vec::new(),
            plugged: true,
            open_failures: VecDeque::new(),
            open_attempts: 0,
            open_delay: Duration::ZERO,
        }
    }
}

/// Shared handle steering a [`ReplayTransport`]
#[derive(Clone, Default)]
pub struct ReplayControl {
    state: Arc<Mutex<ReplayState>>,
}

impl ReplayControl {
    /// Create a control with no responder and the link plugged in
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the closure answering sent frames
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&CanFrame) -> Reply + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
    }

    /// Deliver a frame on the next receive
    pub fn push_frame(&self, frame: CanFrame) {
        self.state.lock().inbox.push_back(frame);
    }

    /// Deliver a frame once `delay` has elapsed from now
    pub fn schedule_in(&self, delay: Duration, frame: CanFrame) {
        let due = Instant::now() + delay;
        let mut state = self.state.lock();
        let pos = state.schedule.iter().position(|s| s.due > due).unwrap_or(state.schedule.len());
        state.schedule.insert(pos, ScheduledFrame { due, frame });
    }

    /// Schedule every frame of a recording relative to now
    pub fn schedule_recording(&self, recording: &FrameRecording) -> Result<usize> {
        let frames = recording.frames()?;
        let count = frames.len();
        for (offset, frame) in frames {
            self.schedule_in(offset, frame);
        }
        Ok(count)
    }

    /// Simulate pulling the USB cable
    pub fn unplug(&self) {
        self.state.lock().plugged = false;
    }

    /// Simulate plugging the USB cable back in
    pub fn plug(&self) {
        self.state.lock().plugged = true;
    }

    /// Make the next open fail with this error
    pub fn fail_next_open(&self, err: ConnectionError) {
        self.state.lock().open_failures.push_back(err);
    }

    /// Make every open take this long, like a slow adapter handshake
    pub fn set_open_delay(&self, delay: Duration) {
        self.state.lock().open_delay = delay;
    }

    /// Number of open calls so far
    pub fn open_attempts(&self) -> u32 {
        self.state.lock().open_attempts
    }

    /// Frames sent so far
    pub fn sent(&self) -> Vec<CanFrame> {
        self.state.lock().sent.clone()
    }

    /// Forget recorded sent frames
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }
}

/// Transport replaying scripted or recorded frames
pub struct ReplayTransport {
    name: String,
    control: ReplayControl,
    open: bool,
    opened_at: Option<Instant>,
    stats: TransportStats,
}

impl ReplayTransport {
    /// Create a transport steered by `control`
    pub fn new(name: &str, control: ReplayControl) -> Self {
        Self {
            name: name.to_string(),
            control,
            open: false,
            opened_at: None,
            stats: TransportStats::default(),
        }
    }

    /// Shared control handle
    pub fn control(&self) -> ReplayControl {
        self.control.clone()
    }

    fn check_link(&mut self) -> Result<()> {
        if !self.control.state.lock().plugged {
            self.open = false;
            return Err(ConnectionError::Disconnected(format!("{}: device unplugged", self.name)).into());
        }
        if !self.open {
            return Err(ConnectionError::Disconnected(format!("{}: transport not open", self.name)).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn open(&mut self) -> Result<AdapterInfo> {
        let delay = {
            let mut state = self.control.state.lock();
            state.open_attempts += 1;
            state.open_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = {
            let mut state = self.control.state.lock();
            if state.plugged {
                state.open_failures.pop_front()
            } else {
                Some(ConnectionError::DeviceNotFound(self.name.clone()))
            }
        };
        if let Some(err) = failure {
            return Err(err.into());
        }

        self.open = true;
        self.opened_at = Some(Instant::now());
        self.stats = TransportStats::default();
        Ok(AdapterInfo {
            kind: AdapterKind::Replay,
            hardware_version: "00".into(),
            firmware_version: "00".into(),
        })
    }

    async fn send(&mut self, frame: &CanFrame, timeout: Duration) -> Result<()> {
        self.check_link()?;
        let reply = {
            let mut state = self.control.state.lock();
            state.sent.push(frame.clone());
            match state.responder.as_mut() {
                Some(responder) => responder(frame),
                None => Reply::Ack(Vec::new()),
            }
        };
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += slcan::encode(frame).len() as u64;

        match reply {
            Reply::Ack(frames) => {
                self.control.state.lock().inbox.extend(frames);
                Ok(())
            }
            Reply::Nak => {
                self.stats.naks += 1;
                Err(CanError::Rejected.into())
            }
            Reply::Silence => {
                tokio::time::sleep(timeout).await;
                Err(TimeoutError::Write(timeout).into())
            }
        }
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>> {
        self.check_link()?;
        let deadline = Instant::now() + timeout;

        let next_due = {
            let mut state = self.control.state.lock();
            if let Some(frame) = state.inbox.pop_front() {
                drop(state);
                self.stats.frames_received += 1;
                return Ok(Some(frame));
            }
            state.schedule.front().map(|s| s.due)
        };

        match next_due {
            Some(due) if due <= deadline => {
                tokio::time::sleep_until(due).await;
                self.check_link()?;
                let frame = self.control.state.lock().schedule.pop_front().map(|s| s.frame);
                if frame.is_some() {
                    self.stats.frames_received += 1;
                }
                Ok(frame)
            }
            _ => {
                tokio::time::sleep_until(deadline).await;
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        self.opened_at = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open && self.control.state.lock().plugged
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Replay
    }

    fn describe(&self) -> String {
        format!("replay:{}", self.name)
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.stats.clone();
        if let Some(opened_at) = self.opened_at {
            stats.uptime_secs = opened_at.elapsed().as_secs();
        }
        stats
    }
}

/// One frame in a recording
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedFrame {
    /// Milliseconds since the recording started
    pub offset_ms: u64,
    /// SLCAN line without terminator
    pub line: String,
}

/// Captured bus traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecording {
    /// Recording format version
    pub version: u32,
    /// When the capture started
    pub captured_at: DateTime<Local>,
    /// Free-form description (adapter, controller firmware, ...)
    #[serde(default)]
    pub description: String,
    /// Captured frames in arrival order
    pub frames: Vec<RecordedFrame>,
}

impl FrameRecording {
    /// Current recording format version
    pub const VERSION: u32 = 1;

    /// Start an empty recording
    pub fn new(description: &str) -> Self {
        Self {
            version: Self::VERSION,
            captured_at: Local::now(),
            description: description.to_string(),
            frames: Vec::new(),
        }
    }

    /// Append a frame captured `offset` after the start
    pub fn push(&mut self, offset: Duration, frame: &CanFrame) {
        self.frames.push(RecordedFrame {
            offset_ms: offset.as_millis() as u64,
            line: slcan::encode(frame).trim_end().to_string(),
        });
    }

    /// Decode all frames with their offsets
    pub fn frames(&self) -> Result<Vec<(Duration, CanFrame)>> {
        self.frames
            .iter()
            .map(|rec| {
                slcan::decode(&rec.line)
                    .map(|frame| (Duration::from_millis(rec.offset_ms), frame))
                    .map_err(Error::from)
            })
            .collect()
    }

    /// Save to file (JSON)
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self).map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Load from file (JSON)
    pub fn load_json(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let recording: Self =
            serde_json::from_reader(BufReader::new(file)).map_err(std::io::Error::from)?;
        if recording.version != Self::VERSION {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported recording version {}", recording.version),
            )
            .into());
        }
        Ok(recording)
    }
}
