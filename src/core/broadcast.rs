//! Broadcast Monitor
//!
//! Passive read path. The controller broadcasts some values periodically in
//! full even when a direct request for them only yields a truncated
//! acknowledgement. [`BroadcastMonitor::collect`] listens for a window and
//! keeps the newest reading per `(base, index)` key of the broadcast map.
//!
//! A frame that cannot be decoded, or a window in which a key is not seen,
//! never removes the previous reading for that key. Garbled adapter lines
//! are counted and skipped; only link failures end a collection early.

use crate::core::codec::{Value, ValueFormat};
use crate::core::connection::Connection;
use crate::core::error::{CanError, Error, Result};
use crate::core::frame::{split_id, CanFrame, INDEX_SHIFT, MAX_EXTENDED_ID, MAX_INDEX};
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default window for read fallbacks
pub const DEFAULT_FALLBACK_WINDOW: Duration = Duration::from_secs(5);

/// Identifier base and element index of a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BroadcastKey {
    /// Identifier with the index bits cleared
    pub base: u32,
    /// Element index
    pub index: u16,
}

impl BroadcastKey {
    /// Create a key
    pub fn new(base: u32, index: u16) -> Self {
        Self { base, index }
    }

    /// Key of a received frame
    pub fn of(frame: &CanFrame) -> Self {
        let (base, index) = split_id(frame.id());
        Self { base, index }
    }

    /// Identifier a frame with this key carries
    pub fn id(&self) -> u32 {
        self.base | (u32::from(self.index & MAX_INDEX) << INDEX_SHIFT)
    }

    /// True when a received frame can produce this key
    pub fn is_addressable(&self) -> bool {
        self.base <= MAX_EXTENDED_ID && self.index <= MAX_INDEX && split_id(self.base) == (self.base, 0)
    }
}

/// How to interpret one broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastSpec {
    /// Parameter name
    pub name: String,
    /// Payload format
    pub format: ValueFormat,
}

/// Known broadcasts
#[derive(Debug, Clone, Default)]
pub struct BroadcastMap {
    entries: HashMap<BroadcastKey, BroadcastSpec>,
}

impl BroadcastMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a mapping
    pub fn insert(&mut self, key: BroadcastKey, name: &str, format: ValueFormat) {
        self.entries.insert(
            key,
            BroadcastSpec {
                name: name.to_string(),
                format,
            },
        );
    }

    /// Mapping for a key
    pub fn get(&self, key: &BroadcastKey) -> Option<&BroadcastSpec> {
        self.entries.get(key)
    }

    /// Number of mappings
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Most recent value seen for one key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastReading {
    /// Key
    pub key: BroadcastKey,
    /// Parameter name
    pub name: String,
    /// Payload as received
    pub raw: Vec<u8>,
    /// Decoded value
    pub value: Value,
    /// When it was received
    pub captured_at: DateTime<Local>,
}

/// Copy of the broadcast cache after a collection
#[derive(Debug, Clone, Default)]
pub struct CacheSnapshot {
    /// Readings by key
    pub readings: HashMap<BroadcastKey, BroadcastReading>,
    /// Frames received during the window
    pub frames_seen: usize,
    /// Frames that updated a reading
    pub frames_matched: usize,
    /// Lines the adapter delivered that were not valid frames
    pub frames_rejected: usize,
}

impl CacheSnapshot {
    /// Reading for a key
    pub fn get(&self, base: u32, index: u16) -> Option<&BroadcastReading> {
        self.readings.get(&BroadcastKey::new(base, index))
    }

    /// Readings sorted by key
    pub fn sorted(&self) -> Vec<&BroadcastReading> {
        let mut readings: Vec<_> = self.readings.values().collect();
        readings.sort_by_key(|r| r.key);
        readings
    }
}

/// Collects broadcasts into a most-recent-wins cache
#[derive(Clone)]
pub struct BroadcastMonitor {
    conn: Connection,
    map: Arc<RwLock<BroadcastMap>>,
    cache: Arc<RwLock<HashMap<BroadcastKey, BroadcastReading>>>,
}

impl BroadcastMonitor {
    /// Create a monitor with an initial map
    pub fn new(conn: Connection, map: BroadcastMap) -> Self {
        Self {
            conn,
            map: Arc::new(RwLock::new(map)),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add a mapping
    pub fn watch(&self, key: BroadcastKey, name: &str, format: ValueFormat) {
        self.map.write().insert(key, name, format);
    }

    /// Copy of the map
    pub fn map(&self) -> BroadcastMap {
        self.map.read().clone()
    }

    /// Listen for `window` and return the cache afterwards
    pub async fn collect(&self, window: Duration) -> Result<CacheSnapshot> {
        let mut link = self.conn.lock()?;
        let deadline = Instant::now() + window;
        let mut frames_seen = 0;
        let mut frames_matched = 0;
        let mut frames_rejected = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match link.receive(remaining).await {
                Ok(Some(frame)) => {
                    frames_seen += 1;
                    if self.ingest(&frame).is_some() {
                        frames_matched += 1;
                    }
                }
                Ok(None) => {}
                Err(Error::Can(CanError::MalformedFrame(e))) => {
                    frames_rejected += 1;
                    warn!(error = %e, "malformed line skipped during broadcast collection");
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            window = ?window,
            frames_seen,
            frames_matched,
            frames_rejected,
            "broadcast collection finished"
        );
        Ok(CacheSnapshot {
            readings: self.cache.read().clone(),
            frames_seen,
            frames_matched,
            frames_rejected,
        })
    }

    /// Store a frame if it matches the map and decodes
    pub fn ingest(&self, frame: &CanFrame) -> Option<BroadcastReading> {
        if frame.is_remote() {
            return None;
        }
        let key = BroadcastKey::of(frame);
        let spec = self.map.read().get(&key).cloned()?;
        let value = match spec.format.decode(frame.data()) {
            Ok(value) => value,
            Err(e) => {
                trace!(name = %spec.name, frame = %frame, error = %e, "undecodable broadcast ignored");
                return None;
            }
        };

        let reading = BroadcastReading {
            key,
            name: spec.name,
            raw: frame.data().to_vec(),
            value,
            captured_at: Local::now(),
        };
        self.cache.write().insert(key, reading.clone());
        Some(reading)
    }

    /// Most recent reading for a key
    pub fn get(&self, base: u32, index: u16) -> Option<BroadcastReading> {
        self.cache.read().get(&BroadcastKey::new(base, index)).cloned()
    }

    /// Copy of the cache
    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            readings: self.cache.read().clone(),
            ..CacheSnapshot::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::ConnectionConfig;
    use crate::core::frame::{response_id, RESPONSE_BASE};
    use crate::core::transport::{AdapterConfig, ReplayControl, ReplayTransport};

    async fn monitor() -> (ReplayControl, BroadcastMonitor) {
        let control = ReplayControl::new();
        let transport = ReplayTransport::new("test", control.clone());
        let conn = Connection::with_transport(
            Box::new(transport),
            ConnectionConfig::new(AdapterConfig::new("test", 115_200)).auto_reconnect(false),
        )
        .await
        .unwrap();
        let mut map = BroadcastMap::new();
        map.insert(BroadcastKey::new(RESPONSE_BASE, 1), "GT1_T", ValueFormat::Temp);
        (control, BroadcastMonitor::new(conn, map))
    }

    fn frame(index: u16, data: &[u8]) -> CanFrame {
        CanFrame::new_extended(response_id(index), data).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_reading_wins() {
        let (control, monitor) = monitor().await;
        control.schedule_in(Duration::from_millis(100), frame(1, &[0x00, 0xD7]));
        control.schedule_in(Duration::from_millis(900), frame(1, &[0x00, 0xDC]));

        let snapshot = monitor.collect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(snapshot.frames_matched, 2);
        assert_eq!(snapshot.readings.len(), 1);
        let reading = monitor.get(RESPONSE_BASE, 1).unwrap();
        assert_eq!(reading.value, Value::Temperature(22.0));
        assert_eq!(reading.raw, vec![0x00, 0xDC]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_or_bad_frames_keep_previous_value() {
        let (control, monitor) = monitor().await;
        control.schedule_in(Duration::from_millis(100), frame(1, &[0x00, 0xD7]));
        monitor.collect(Duration::from_millis(500)).await.unwrap();

        control.schedule_in(Duration::from_millis(100), frame(1, &[0x01]));
        control.schedule_in(Duration::from_millis(200), frame(7, &[0x00, 0x01]));
        let snapshot = monitor.collect(Duration::from_millis(500)).await.unwrap();
        assert_eq!(snapshot.frames_seen, 2);
        assert_eq!(snapshot.frames_matched, 0);
        assert_eq!(snapshot.get(RESPONSE_BASE, 1).unwrap().value, Value::Temperature(21.5));
        assert!(monitor.get(RESPONSE_BASE, 7).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_is_bounded_by_window() {
        let (_control, monitor) = monitor().await;
        let started = Instant::now();
        let snapshot = monitor.collect(Duration::from_secs(5)).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert!(snapshot.readings.is_empty());
    }
}
