//! Shared helpers for the integration tests: a simulated controller that
//! answers discovery and parameter requests through the replay transport.

#![allow(dead_code)]

use heatlink_core::core::connection::{Connection, ConnectionConfig};
use heatlink_core::core::discovery::{
    encode_table, DiscoveredElement, DiscoveryConfig, CHUNK_DATA_ID, CHUNK_FETCH_ID, CHUNK_REQUEST_ID,
    TABLE_LENGTH_REQUEST_ID, TABLE_LENGTH_RESPONSE_ID,
};
use heatlink_core::core::frame::{response_id, split_id, CanFrame, READ_REQUEST_BASE};
use heatlink_core::core::state_machine::BackoffPolicy;
use heatlink_core::core::transport::{AdapterConfig, ReplayControl, ReplayTransport, Reply};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

pub fn element(index: u16, name: &str) -> DiscoveredElement {
    DiscoveredElement {
        index,
        extid: [0, 0, 0, 0, 0, (index >> 8) as u8, index as u8],
        max: 1000,
        min: -1000,
        name: name.to_string(),
    }
}

/// `count` elements with 12-character names: 30 bytes each
pub fn elements(count: u16) -> Vec<DiscoveredElement> {
    (0..count).map(|i| element(i, &format!("PARAM_{i:06}"))).collect()
}

#[derive(Default)]
struct ControllerState {
    table: Vec<u8>,
    limits: Vec<usize>,
    length_requests: usize,
    chunk_requests: usize,
    pending_chunk: Option<(usize, usize)>,
    values: HashMap<u16, Vec<u8>>,
    writes: Vec<CanFrame>,
    silent: bool,
}

/// Simulated heat pump controller
#[derive(Clone, Default)]
pub struct Controller {
    state: Arc<Mutex<ControllerState>>,
}

impl Controller {
    pub fn new(elements: &[DiscoveredElement]) -> Self {
        let controller = Self::default();
        controller.state.lock().table = encode_table(elements);
        controller
    }

    pub fn table_len(&self) -> usize {
        self.state.lock().table.len()
    }

    /// Bytes served per transfer attempt; later attempts serve everything
    pub fn deliver_per_attempt(&self, limits: &[usize]) {
        self.state.lock().limits = limits.to_vec();
    }

    pub fn set_value(&self, index: u16, bytes: &[u8]) {
        self.state.lock().values.insert(index, bytes.to_vec());
    }

    /// Stop acknowledging anything
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    pub fn length_requests(&self) -> usize {
        self.state.lock().length_requests
    }

    pub fn chunk_requests(&self) -> usize {
        self.state.lock().chunk_requests
    }

    pub fn writes(&self) -> Vec<CanFrame> {
        self.state.lock().writes.clone()
    }

    pub fn install(&self, control: &ReplayControl) {
        let state = self.state.clone();
        control.set_responder(move |frame| respond(&mut state.lock(), frame));
    }
}

fn ext(id: u32, data: &[u8]) -> CanFrame {
    CanFrame::new_extended(id, data).unwrap()
}

fn respond(state: &mut ControllerState, frame: &CanFrame) -> Reply {
    if state.silent {
        return Reply::Silence;
    }
    match (frame.id(), frame.is_remote()) {
        (TABLE_LENGTH_REQUEST_ID, true) => {
            state.length_requests += 1;
            let len = state.table.len() as u32;
            Reply::Ack(vec![ext(TABLE_LENGTH_RESPONSE_ID, &len.to_be_bytes())])
        }
        (CHUNK_REQUEST_ID, false) => {
            let data = frame.data();
            let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            let offset = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
            state.chunk_requests += 1;
            state.pending_chunk = Some((offset, len));
            Reply::Ack(Vec::new())
        }
        (CHUNK_FETCH_ID, true) => {
            let Some((offset, len)) = state.pending_chunk.take() else {
                return Reply::Ack(Vec::new());
            };
            let limit = state
                .limits
                .get(state.length_requests.saturating_sub(1))
                .copied()
                .unwrap_or(state.table.len())
                .min(state.table.len());
            let end = (offset + len).min(limit);
            let bytes = if offset < end { &state.table[offset..end] } else { &[][..] };
            Reply::Ack(bytes.chunks(8).map(|c| ext(CHUNK_DATA_ID, c)).collect())
        }
        (id, true) if split_id(id).0 == READ_REQUEST_BASE => {
            let (_, index) = split_id(id);
            match state.values.get(&index) {
                Some(bytes) => Reply::Ack(vec![ext(response_id(index), bytes)]),
                None => Reply::Ack(Vec::new()),
            }
        }
        _ => {
            state.writes.push(frame.clone());
            Reply::Ack(Vec::new())
        }
    }
}

pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig::new(AdapterConfig::new("sim", 115_200).timeout(Duration::from_millis(500))).backoff(
        BackoffPolicy {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        },
    )
}

/// Replay transport steered by `controller`, opened
pub async fn connect(controller: &Controller) -> (ReplayControl, Connection) {
    let control = ReplayControl::new();
    controller.install(&control);
    let transport = ReplayTransport::new("sim", control.clone());
    let conn = Connection::with_transport(Box::new(transport), connection_config())
        .await
        .unwrap();
    (control, conn)
}

pub fn discovery_config(cache_path: Option<PathBuf>) -> DiscoveryConfig {
    DiscoveryConfig {
        cache_path,
        chunk_timeout: Duration::from_millis(200),
        retry_delay: Duration::from_secs(1),
        ..DiscoveryConfig::default()
    }
}

/// Formatted log output captured for assertions
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Capture everything logged on this thread until the guard drops
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        (capture, tracing::subscriber::set_default(subscriber))
    }

    /// Captured lines containing `message`
    pub fn lines_with(&self, message: &str) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .filter(|line| line.contains(message))
            .map(str::to_string)
            .collect()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
