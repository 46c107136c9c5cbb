//! Heat pump client
//!
//! Ties the pieces together for callers: parameters are resolved through
//! the element registry, read directly over the connection, and read from
//! broadcasts when the direct reply has the wrong shape. Every read updates
//! the freshness tracker.

use crate::core::broadcast::{BroadcastKey, BroadcastMap, BroadcastMonitor, DEFAULT_FALLBACK_WINDOW};
use crate::core::codec::{Value, ValueFormat};
use crate::core::connection::Connection;
use crate::core::discovery::{DiscoveredElement, ElementRegistry};
use crate::core::error::{Error, Result};
use crate::core::frame::{CanFrame, RESPONSE_BASE};
use crate::core::freshness::{Freshness, FreshnessTracker, DEFAULT_STALE_AFTER};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A parameter addressed by name or by element index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    /// Registry name
    Name(String),
    /// Element index
    Index(u16),
}

impl Param {
    /// Parse user input: decimal or `0x` hex numbers are indices
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let index = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16).ok(),
            None => text.parse().ok(),
        };
        index.map_or_else(|| Self::Name(text.to_string()), Self::Index)
    }
}

impl From<&str> for Param {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<u16> for Param {
    fn from(index: u16) -> Self {
        Self::Index(index)
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::Index(index) => write!(f, "#{index}"),
        }
    }
}

/// Which path supplied a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    /// Reply to a direct request
    Direct,
    /// Periodic broadcast
    Broadcast,
}

impl fmt::Display for ValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// A decoded parameter value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Parameter name
    pub name: String,
    /// Element index
    pub index: u16,
    /// Decoded value
    pub value: Value,
    /// Payload bytes
    pub raw: Vec<u8>,
    /// Path that supplied the value
    pub source: ValueSource,
    /// When it was obtained
    pub at: DateTime<Local>,
}

/// Acknowledged write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    /// Identifier written to
    pub can_id: u32,
    /// Bytes written
    pub payload: Vec<u8>,
}

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout for direct requests and writes
    pub timeout: Duration,
    /// Broadcast window when a direct reply is unusable
    pub fallback_window: Duration,
    /// Consecutive failures before a value is reported stale
    pub stale_after: u32,
    /// Broadcast carrying a parameter, by name, when it is not the
    /// parameter's own response identifier
    pub broadcast_keys: HashMap<String, BroadcastKey>,
}

impl ClientConfig {
    /// Map a parameter to the broadcast that carries it
    #[must_use]
    pub fn broadcast_key(mut self, name: &str, key: BroadcastKey) -> Self {
        self.broadcast_keys.insert(name.to_string(), key);
        self
    }

    /// Broadcast to watch for an element
    pub fn key_for(&self, element: &DiscoveredElement) -> BroadcastKey {
        self.broadcast_keys
            .get(&element.name)
            .copied()
            .unwrap_or_else(|| BroadcastKey::new(RESPONSE_BASE, element.index))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            fallback_window: DEFAULT_FALLBACK_WINDOW,
            stale_after: DEFAULT_STALE_AFTER,
            broadcast_keys: HashMap::new(),
        }
    }
}

/// Parameter-level access to the controller
pub struct HeatPump {
    conn: Connection,
    registry: ElementRegistry,
    monitor: BroadcastMonitor,
    freshness: FreshnessTracker,
    config: ClientConfig,
}

impl HeatPump {
    /// Create a client over a connection and a populated registry
    pub fn new(conn: Connection, registry: ElementRegistry, config: ClientConfig) -> Self {
        let monitor = BroadcastMonitor::new(conn.clone(), BroadcastMap::new());
        let freshness = FreshnessTracker::new(config.stale_after);
        Self {
            conn,
            registry,
            monitor,
            freshness,
            config,
        }
    }

    /// Underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Element registry
    pub fn registry(&self) -> &ElementRegistry {
        &self.registry
    }

    /// Broadcast monitor used for fallbacks
    pub fn monitor(&self) -> &BroadcastMonitor {
        &self.monitor
    }

    /// Freshness of every parameter read so far
    pub fn freshness(&self) -> &FreshnessTracker {
        &self.freshness
    }

    /// Freshness of one parameter
    pub fn status(&self, name: &str) -> Freshness {
        self.freshness.status(name)
    }

    /// Resolve a parameter through the registry
    pub fn resolve(&self, param: &Param) -> Result<DiscoveredElement> {
        let element = match param {
            Param::Name(name) => self.registry.lookup_by_name(name),
            Param::Index(index) => self.registry.lookup_by_index(*index),
        };
        element.ok_or_else(|| Error::UnknownParameter(param.to_string()))
    }

    /// Request a parameter and return the raw reply payload
    pub async fn request(&self, param: &Param, timeout: Duration) -> Result<Vec<u8>> {
        let element = self.resolve(param)?;
        self.request_element(&element, timeout).await
    }

    async fn request_element(&self, element: &DiscoveredElement, timeout: Duration) -> Result<Vec<u8>> {
        let request = CanFrame::new_remote(element.request_id(), true)?;
        let reply = self.conn.request(&request, element.response_id(), timeout).await?;
        debug!(name = %element.name, reply = %reply, "direct reply");
        Ok(reply.data().to_vec())
    }

    /// Write raw bytes to a parameter.
    ///
    /// Bounds are not checked here. A rejected write is not retried.
    pub async fn write(&self, param: &Param, bytes: &[u8], timeout: Duration) -> Result<Ack> {
        let element = self.resolve(param)?;
        let frame = CanFrame::new_extended(element.response_id(), bytes)?;
        self.conn.lock()?.send_timeout(&frame, timeout).await?;
        info!(name = %element.name, can_id = format_args!("{:#010X}", frame.id()), bytes = %hex::encode_upper(bytes), "parameter written");
        Ok(Ack {
            can_id: frame.id(),
            payload: bytes.to_vec(),
        })
    }

    /// Encode and write a value
    pub async fn write_value(&self, param: &Param, format: ValueFormat, value: &Value) -> Result<Ack> {
        let bytes = format.encode(value)?;
        self.write(param, &bytes, self.config.timeout).await
    }

    /// Read and decode a parameter.
    ///
    /// When the direct reply does not fit `format`, broadcasts are collected
    /// for the fallback window and the newest one seen in it is used.
    pub async fn read_value(&self, param: &Param, format: ValueFormat) -> Result<Reading> {
        let element = self.resolve(param)?;
        let result = self.read_element(&element, format).await;
        match &result {
            Ok(reading) => self.freshness.record_success(&element.name, reading.value),
            Err(e) => {
                self.freshness.record_failure(&element.name);
                debug!(name = %element.name, error = %e, failures = self.freshness.failures(&element.name), "read failed");
            }
        }
        result
    }

    async fn read_element(&self, element: &DiscoveredElement, format: ValueFormat) -> Result<Reading> {
        let raw = self.request_element(element, self.config.timeout).await?;
        if format.accepts(&raw) {
            return Ok(Reading {
                name: element.name.clone(),
                index: element.index,
                value: format.decode(&raw)?,
                raw,
                source: ValueSource::Direct,
                at: Local::now(),
            });
        }

        warn!(
            name = %element.name,
            got = raw.len(),
            want = format.byte_len(),
            window = ?self.config.fallback_window,
            "unusable direct reply, collecting broadcasts"
        );
        let key = self.config.key_for(element);
        self.monitor.watch(key, &element.name, format);

        let started = Local::now();
        let snapshot = self.monitor.collect(self.config.fallback_window).await?;
        match snapshot.get(key.base, key.index).filter(|r| r.captured_at >= started) {
            Some(reading) => Ok(Reading {
                name: element.name.clone(),
                index: element.index,
                value: reading.value,
                raw: reading.raw.clone(),
                source: ValueSource::Broadcast,
                at: reading.captured_at,
            }),
            None => Err(Error::NoValue {
                name: element.name.clone(),
                reason: format!(
                    "direct reply had {} of {} bytes and no broadcast arrived within {:?}",
                    raw.len(),
                    format.byte_len(),
                    self.config.fallback_window
                ),
            }),
        }
    }
}
