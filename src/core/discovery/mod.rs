//! Element Discovery
//!
//! Learns which index each named parameter has on the connected controller.
//!
//! One attempt:
//! 1. ask for the table length (RTR on [`TABLE_LENGTH_REQUEST_ID`])
//! 2. read the table in chunks of at most [`MAX_CHUNK_SIZE`] bytes; each
//!    chunk is requested with `[length u32][offset u32]` and fetched with an
//!    RTR, then arrives as 8-byte data frames
//! 3. stop at the reported length or when the link stalls
//!
//! An attempt is complete when it delivered at least the configured share
//! (95 %) of the reported bytes. Incomplete attempts are retried after a
//! fixed delay. When every attempt fails the last valid cache is used, or
//! discovery fails and the caller must not start: static default indices
//! are never substituted.

mod cache;
mod parser;
mod registry;

pub use cache::{CacheStatus, CachedElement, DiscoveryCache, SCHEMA_VERSION};
pub use parser::{encode_table, parse_element, parse_table, DiscoveredElement, EXTID_LEN, HEADER_LEN};
pub use registry::{ElementRegistry, IndexChange, RegistrySource};

use crate::core::connection::{Connection, LinkGuard};
use crate::core::error::{DiscoveryError, Error, Result};
use crate::core::frame::CanFrame;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Table length request (RTR)
pub const TABLE_LENGTH_REQUEST_ID: u32 = 0x01FD_7FE0;
/// Table length reply
pub const TABLE_LENGTH_RESPONSE_ID: u32 = 0x09FD_7FE0;
/// Chunk request carrying length and offset
pub const CHUNK_REQUEST_ID: u32 = 0x01FD_3FE0;
/// Chunk fetch (RTR)
pub const CHUNK_FETCH_ID: u32 = 0x01FD_BFE0;
/// Chunk data frames
pub const CHUNK_DATA_ID: u32 = 0x09FD_BFE0;

/// Largest chunk the controller serves
pub const MAX_CHUNK_SIZE: usize = 4096;

/// Largest table length accepted from the controller
pub const MAX_TABLE_SIZE: u32 = 1 << 20;

/// Discovery settings
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Cache file; no caching when `None`
    pub cache_path: Option<PathBuf>,
    /// Age after which a cache no longer replaces a fresh transfer
    pub max_cache_age: Duration,
    /// Transfer attempts
    pub attempts: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
    /// Bytes per chunk, clamped to [`MAX_CHUNK_SIZE`]
    pub chunk_size: usize,
    /// Time allowed for one chunk, and for the length reply
    pub chunk_timeout: Duration,
    /// Share of reported bytes an attempt must deliver
    pub completeness_percent: u8,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            max_cache_age: Duration::from_secs(24 * 3600),
            attempts: 3,
            retry_delay: Duration::from_secs(2),
            chunk_size: MAX_CHUNK_SIZE,
            chunk_timeout: Duration::from_secs(2),
            completeness_percent: 95,
        }
    }
}

/// Where the applied table came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    /// Transferred from the controller in this run
    Fresh,
    /// Cache within its age limit; no transfer attempted
    Cache,
    /// Transfer failed; last valid cache used instead
    CacheFallback,
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Cache => write!(f, "cache"),
            Self::CacheFallback => write!(f, "cache (fallback)"),
        }
    }
}

/// Result of [`Discovery::run`]
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    /// Where the table came from
    pub source: DiscoverySource,
    /// Elements applied
    pub elements: usize,
    /// Bytes received (transfer or cached)
    pub bytes_received: usize,
    /// Bytes reported by the controller
    pub bytes_expected: usize,
    /// Transfer attempts made
    pub attempts: u32,
    /// Index changes against the previous registry contents
    pub changes: Vec<IndexChange>,
}

/// Raw table bytes from one attempt
#[derive(Debug, Clone)]
pub struct Transfer {
    /// Concatenated chunk data
    pub buffer: Vec<u8>,
    /// Length reported by the controller
    pub expected: usize,
    /// Chunk requests issued
    pub chunks: usize,
}

impl Transfer {
    /// Check the completeness threshold
    pub fn is_complete(&self, percent: u8) -> bool {
        self.buffer.len() * 100 >= self.expected * usize::from(percent)
    }
}

/// Runs discovery against one connection and fills a registry
pub struct Discovery {
    conn: Connection,
    registry: ElementRegistry,
    config: DiscoveryConfig,
}

impl Discovery {
    /// Create a discovery driver
    pub fn new(conn: Connection, registry: ElementRegistry, config: DiscoveryConfig) -> Self {
        Self { conn, registry, config }
    }

    /// Registry filled by this driver
    pub fn registry(&self) -> &ElementRegistry {
        &self.registry
    }

    /// Settings
    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Populate the registry from a fresh cache or a transfer.
    ///
    /// `force` skips the cache age check and always transfers.
    pub async fn run(&self, force: bool) -> Result<DiscoveryOutcome> {
        let cached = self
            .config
            .cache_path
            .as_deref()
            .map(DiscoveryCache::load)
            .and_then(CacheStatus::valid);

        if let Some(cache) = cached.as_ref().filter(|c| !force && !c.is_expired(self.config.max_cache_age)) {
            info!(age_secs = cache.age().as_secs(), elements = cache.elements.len(), "using discovery cache");
            return self.apply_cache(cache, DiscoverySource::Cache, 0);
        }

        match self.transfer().await {
            Ok((transfer, attempts)) => self.apply_transfer(&transfer, attempts),
            Err((err, attempts)) => match cached {
                Some(cache) => {
                    warn!(
                        error = %err,
                        attempts,
                        age_secs = cache.age().as_secs(),
                        "element discovery failed, falling back to cached table"
                    );
                    self.apply_cache(&cache, DiscoverySource::CacheFallback, attempts)
                }
                None => Err(err),
            },
        }
    }

    fn apply_cache(&self, cache: &DiscoveryCache, source: DiscoverySource, attempts: u32) -> Result<DiscoveryOutcome> {
        let elements = cache.to_elements()?;
        let count = elements.len();
        let changes = self.registry.apply(elements, RegistrySource::Cache);
        Ok(DiscoveryOutcome {
            source,
            elements: count,
            bytes_received: cache.bytes_received,
            bytes_expected: cache.bytes_expected,
            attempts,
            changes,
        })
    }

    fn apply_transfer(&self, transfer: &Transfer, attempts: u32) -> Result<DiscoveryOutcome> {
        let elements = parse_table(&transfer.buffer);
        let received = transfer.buffer.len();
        info!(
            elements = elements.len(),
            received,
            expected = transfer.expected,
            attempts,
            "element table discovered"
        );

        if let Some(path) = &self.config.cache_path {
            let cache = DiscoveryCache::new(&elements, received, transfer.expected, true);
            if let Err(e) = cache.save(path) {
                warn!(path = %path.display(), error = %e, "could not write discovery cache");
            }
        }

        let count = elements.len();
        let changes = self.registry.apply(elements, RegistrySource::Discovery);
        Ok(DiscoveryOutcome {
            source: DiscoverySource::Fresh,
            elements: count,
            bytes_received: received,
            bytes_expected: transfer.expected,
            attempts,
            changes,
        })
    }

    /// Transfer the table, retrying incomplete attempts.
    ///
    /// Returns the first complete transfer and the attempt count, or the
    /// final error and the attempts made. Link loss and lock contention end
    /// the retries early.
    pub async fn transfer(&self) -> std::result::Result<(Transfer, u32), (Error, u32)> {
        let attempts = self.config.attempts.max(1);
        let mut best: Option<(usize, usize)> = None;
        let mut last_err = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            let result = match self.conn.lock() {
                Ok(mut link) => self.attempt(&mut link).await,
                Err(busy) => Err(busy.into()),
            };

            match result {
                Ok(transfer) if transfer.is_complete(self.config.completeness_percent) => {
                    return Ok((transfer, attempt));
                }
                Ok(transfer) => {
                    let received = transfer.buffer.len();
                    warn!(attempt, received, expected = transfer.expected, "incomplete element table transfer");
                    if best.map_or(true, |(r, _)| received > r) {
                        best = Some((received, transfer.expected));
                    }
                    last_err = Some(Error::from(DiscoveryError::Incomplete {
                        attempt,
                        received,
                        expected: transfer.expected,
                    }));
                }
                Err(e) if e.is_link_failure() || e.is_busy() => {
                    warn!(attempt, error = %e, "element discovery aborted");
                    return Err((e, attempt));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "element table transfer failed");
                    last_err = Some(e);
                }
            }
        }

        let err = match (best, last_err) {
            (Some((received, expected)), _) => DiscoveryError::Exhausted {
                attempts,
                received,
                expected,
            }
            .into(),
            (None, Some(e)) => e,
            (None, None) => DiscoveryError::Exhausted {
                attempts,
                received: 0,
                expected: 0,
            }
            .into(),
        };
        Err((err, attempts))
    }

    async fn attempt(&self, link: &mut LinkGuard<'_>) -> Result<Transfer> {
        let expected = self.request_length(link).await? as usize;
        let chunk_size = self.config.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        let mut buffer = Vec::with_capacity(expected);
        let mut chunks = 0;

        while buffer.len() < expected {
            let len = chunk_size.min(expected - buffer.len());
            let chunk = self.read_chunk(link, buffer.len(), len).await?;
            chunks += 1;
            let stalled = chunk.len() < len;
            buffer.extend_from_slice(&chunk);
            if stalled {
                debug!(offset = buffer.len(), wanted = len, got = chunk.len(), "element table transfer stalled");
                break;
            }
        }

        Ok(Transfer {
            buffer,
            expected,
            chunks,
        })
    }

    async fn request_length(&self, link: &mut LinkGuard<'_>) -> Result<u32> {
        let request = CanFrame::new_remote(TABLE_LENGTH_REQUEST_ID, true)?;
        let reply = link
            .request(&request, TABLE_LENGTH_RESPONSE_ID, self.config.chunk_timeout)
            .await?;
        let bytes: [u8; 4] = reply
            .data()
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(DiscoveryError::LengthReply(reply.dlc()))?;
        let length = u32::from_be_bytes(bytes);
        if length == 0 || length > MAX_TABLE_SIZE {
            return Err(DiscoveryError::InvalidLength(length).into());
        }
        debug!(length, "element table length");
        Ok(length)
    }

    async fn read_chunk(&self, link: &mut LinkGuard<'_>, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut params = [0u8; 8];
        params[..4].copy_from_slice(&(len as u32).to_be_bytes());
        params[4..].copy_from_slice(&(offset as u32).to_be_bytes());

        let timeout = self.config.chunk_timeout;
        link.send_timeout(&CanFrame::new_extended(CHUNK_REQUEST_ID, &params)?, timeout)
            .await?;
        link.send_timeout(&CanFrame::new_remote(CHUNK_FETCH_ID, true)?, timeout)
            .await?;

        let mut chunk = Vec::with_capacity(len);
        let deadline = Instant::now() + timeout;
        while chunk.len() < len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match link.receive(remaining).await? {
                Some(frame) if frame.id() == CHUNK_DATA_ID && !frame.is_remote() => {
                    let take = frame.dlc().min(len - chunk.len());
                    chunk.extend_from_slice(&frame.data()[..take]);
                }
                Some(_) => {}
                None => break,
            }
        }
        Ok(chunk)
    }
}
