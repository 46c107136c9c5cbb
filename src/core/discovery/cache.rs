//! Discovery cache file
//!
//! JSON snapshot of a discovered table with capture metadata. A cache is
//! usable only when it parses, carries the current schema version and was
//! marked complete; anything else is reported as invalid and ignored.

use super::parser::{DiscoveredElement, EXTID_LEN};
use crate::core::error::DiscoveryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Cache schema version; bump on any incompatible change
pub const SCHEMA_VERSION: u32 = 1;

/// One cached element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedElement {
    /// Element index
    pub index: u16,
    /// Extended identifier, hex
    pub extid: String,
    /// Upper bound
    pub max: i32,
    /// Lower bound
    pub min: i32,
    /// Parameter name
    pub name: String,
}

impl From<&DiscoveredElement> for CachedElement {
    fn from(e: &DiscoveredElement) -> Self {
        Self {
            index: e.index,
            extid: e.extid_hex(),
            max: e.max,
            min: e.min,
            name: e.name.clone(),
        }
    }
}

impl TryFrom<&CachedElement> for DiscoveredElement {
    type Error = DiscoveryError;

    fn try_from(c: &CachedElement) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&c.extid)
            .map_err(|e| DiscoveryError::Cache(format!("element {}: bad extid: {e}", c.name)))?;
        let extid: [u8; EXTID_LEN] = bytes
            .try_into()
            .map_err(|_| DiscoveryError::Cache(format!("element {}: extid is not {EXTID_LEN} bytes", c.name)))?;
        Ok(Self {
            index: c.index,
            extid,
            max: c.max,
            min: c.min,
            name: c.name.clone(),
        })
    }
}

/// Persisted discovery result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryCache {
    /// Schema version of this file
    pub schema_version: u32,
    /// When the table was transferred
    pub captured_at: DateTime<Utc>,
    /// Transfer met the completeness threshold
    pub complete: bool,
    /// Bytes received
    pub bytes_received: usize,
    /// Bytes the controller reported
    pub bytes_expected: usize,
    /// Element table
    pub elements: Vec<CachedElement>,
}

/// Result of looking for a cache file
#[derive(Debug, Clone)]
pub enum CacheStatus {
    /// No file
    Missing,
    /// File exists but must not be used
    Invalid(String),
    /// Usable cache
    Valid(DiscoveryCache),
}

impl CacheStatus {
    /// The cache, when valid
    pub fn valid(self) -> Option<DiscoveryCache> {
        match self {
            Self::Valid(cache) => Some(cache),
            _ => None,
        }
    }
}

impl DiscoveryCache {
    /// Snapshot a transfer captured now
    pub fn new(elements: &[DiscoveredElement], bytes_received: usize, bytes_expected: usize, complete: bool) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            captured_at: Utc::now(),
            complete,
            bytes_received,
            bytes_expected,
            elements: elements.iter().map(CachedElement::from).collect(),
        }
    }

    /// Decode the cached elements
    pub fn to_elements(&self) -> Result<Vec<DiscoveredElement>, DiscoveryError> {
        self.elements.iter().map(DiscoveredElement::try_from).collect()
    }

    /// Time since capture; zero when the clock went backwards
    pub fn age(&self) -> Duration {
        (Utc::now() - self.captured_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// True when older than `max_age`, or captured in the future
    pub fn is_expired(&self, max_age: Duration) -> bool {
        match (Utc::now() - self.captured_at).to_std() {
            Ok(age) => age > max_age,
            Err(_) => true,
        }
    }

    /// Write the cache, replacing any previous file
    pub fn save(&self, path: &Path) -> Result<(), DiscoveryError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| DiscoveryError::Cache(format!("{}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| DiscoveryError::Cache(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| DiscoveryError::Cache(format!("{}: {e}", tmp.display())))?;
        fs::rename(&tmp, path).map_err(|e| DiscoveryError::Cache(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), elements = self.elements.len(), "discovery cache written");
        Ok(())
    }

    /// Look for a usable cache at `path`
    pub fn load(path: &Path) -> CacheStatus {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheStatus::Missing,
            Err(e) => return invalid(path, format!("unreadable: {e}")),
        };
        let cache: Self = match serde_json::from_str(&text) {
            Ok(cache) => cache,
            Err(e) => return invalid(path, format!("corrupt: {e}")),
        };
        if cache.schema_version != SCHEMA_VERSION {
            return invalid(
                path,
                format!("schema version {} (expected {SCHEMA_VERSION})", cache.schema_version),
            );
        }
        if !cache.complete {
            return invalid(
                path,
                format!("marked incomplete ({}/{} bytes)", cache.bytes_received, cache.bytes_expected),
            );
        }
        if let Err(e) = cache.to_elements() {
            return invalid(path, e.to_string());
        }
        CacheStatus::Valid(cache)
    }
}

fn invalid(path: &Path, reason: String) -> CacheStatus {
    warn!(path = %path.display(), %reason, "ignoring discovery cache");
    CacheStatus::Invalid(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element() -> DiscoveredElement {
        DiscoveredElement {
            index: 672,
            extid: [0, 0, 0, 0, 1, 2, 3],
            max: 800,
            min: -400,
            name: "GT2_T".into(),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("elements.json");

        DiscoveryCache::new(&[element()], 23, 23, true).save(&path).unwrap();
        let cache = DiscoveryCache::load(&path).valid().unwrap();
        assert_eq!(cache.to_elements().unwrap(), vec![element()]);
        assert!(!cache.is_expired(Duration::from_secs(3600)));
    }

    #[test]
    fn test_missing_corrupt_and_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("elements.json");
        assert!(matches!(DiscoveryCache::load(&path), CacheStatus::Missing));

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(DiscoveryCache::load(&path), CacheStatus::Invalid(_)));

        DiscoveryCache::new(&[element()], 10, 23, false).save(&path).unwrap();
        assert!(matches!(DiscoveryCache::load(&path), CacheStatus::Invalid(r) if r.contains("incomplete")));
    }

    #[test]
    fn test_foreign_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("elements.json");
        let mut cache = DiscoveryCache::new(&[element()], 23, 23, true);
        cache.schema_version = 99;
        cache.save(&path).unwrap();
        assert!(matches!(DiscoveryCache::load(&path), CacheStatus::Invalid(r) if r.contains("schema")));
    }

    #[test]
    fn test_age_check() {
        let mut cache = DiscoveryCache::new(&[element()], 23, 23, true);
        cache.captured_at = Utc::now() - chrono::Duration::hours(25);
        assert!(cache.is_expired(Duration::from_secs(24 * 3600)));
    }

    #[test]
    fn test_future_capture_time_is_expired() {
        let mut cache = DiscoveryCache::new(&[element()], 23, 23, true);
        cache.captured_at = Utc::now() + chrono::Duration::days(30);
        assert_eq!(cache.age(), Duration::ZERO);
        assert!(cache.is_expired(Duration::from_secs(24 * 3600)));
    }
}
