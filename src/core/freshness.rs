//! Last-known-good tracking
//!
//! Readings survive disconnections. A value is `Fresh` after a successful
//! read, turns `Stale` once reads of it have failed `stale_after` times in a
//! row, and is `Unavailable` only until the first successful read. Failures
//! never discard the last good value.

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::codec::Value;
use super::frame::MAX_INDEX;

/// Default number of consecutive failures before a value is stale
pub const DEFAULT_STALE_AFTER: u32 = 3;

/// Never-read parameters whose failures are counted; one per element index
pub const MAX_PENDING: usize = MAX_INDEX as usize + 1;

/// Availability of one parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Freshness {
    /// Never read successfully
    Unavailable,
    /// Last read succeeded, or failures are below the threshold
    Fresh {
        /// Last good value
        value: Value,
        /// When it was read
        at: DateTime<Local>,
    },
    /// Failures reached the threshold; last good value still served
    Stale {
        /// Last good value
        value: Value,
        /// When it was read
        at: DateTime<Local>,
        /// Consecutive failures since
        failures: u32,
    },
}

impl Freshness {
    /// Value to show, if any was ever read
    pub fn value(&self) -> Option<Value> {
        match self {
            Self::Unavailable => None,
            Self::Fresh { value, .. } | Self::Stale { value, .. } => Some(*value),
        }
    }

    /// True when stale
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    at: DateTime<Local>,
    failures: u32,
}

/// Last-known-good values keyed by parameter name
#[derive(Debug, Clone)]
pub struct FreshnessTracker {
    stale_after: u32,
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    pending_failures: Arc<RwLock<HashMap<String, u32>>>,
}

impl Default for FreshnessTracker {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

impl FreshnessTracker {
    /// Create a tracker with the given failure threshold
    pub fn new(stale_after: u32) -> Self {
        Self {
            stale_after: stale_after.max(1),
            entries: Arc::new(RwLock::new(HashMap::new())),
            pending_failures: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record a successful read
    pub fn record_success(&self, name: &str, value: Value) {
        self.pending_failures.write().remove(name);
        self.entries.write().insert(
            name.to_string(),
            Entry {
                value,
                at: Local::now(),
                failures: 0,
            },
        );
    }

    /// Record a failed read; the last good value is kept
    pub fn record_failure(&self, name: &str) {
        if let Some(entry) = self.entries.write().get_mut(name) {
            entry.failures = entry.failures.saturating_add(1);
            return;
        }
        let mut pending = self.pending_failures.write();
        if let Some(failures) = pending.get_mut(name) {
            *failures = failures.saturating_add(1);
        } else if pending.len() < MAX_PENDING {
            pending.insert(name.to_string(), 1);
        } else {
            debug!(name, "failure count table full, not tracking");
        }
    }

    /// Current availability of a parameter
    pub fn status(&self, name: &str) -> Freshness {
        match self.entries.read().get(name) {
            None => Freshness::Unavailable,
            Some(entry) if entry.failures >= self.stale_after => Freshness::Stale {
                value: entry.value,
                at: entry.at,
                failures: entry.failures,
            },
            Some(entry) => Freshness::Fresh {
                value: entry.value,
                at: entry.at,
            },
        }
    }

    /// Consecutive failures for a parameter
    pub fn failures(&self, name: &str) -> u32 {
        self.entries
            .read()
            .get(name)
            .map(|e| e.failures)
            .or_else(|| self.pending_failures.read().get(name).copied())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_until_first_success() {
        let tracker = FreshnessTracker::new(3);
        tracker.record_failure("GT1");
        tracker.record_failure("GT1");
        assert_eq!(tracker.status("GT1"), Freshness::Unavailable);
        assert_eq!(tracker.failures("GT1"), 2);
    }

    #[test]
    fn test_pending_failures_are_bounded() {
        let tracker = FreshnessTracker::new(3);
        for i in 0..MAX_PENDING + 10 {
            tracker.record_failure(&format!("P{i}"));
        }
        assert_eq!(tracker.pending_failures.read().len(), MAX_PENDING);
        assert_eq!(tracker.failures("P0"), 1);
        assert_eq!(tracker.failures(&format!("P{}", MAX_PENDING + 5)), 0);

        // known names keep counting and a success frees a slot
        tracker.record_failure("P0");
        assert_eq!(tracker.failures("P0"), 2);
        tracker.record_success("P0", Value::Temperature(20.0));
        tracker.record_failure("late");
        assert_eq!(tracker.failures("late"), 1);
    }

    #[test]
    fn test_stale_after_threshold_keeps_value() {
        let tracker = FreshnessTracker::new(3);
        tracker.record_success("GT1", Value::Temperature(21.5));

        tracker.record_failure("GT1");
        tracker.record_failure("GT1");
        assert!(matches!(tracker.status("GT1"), Freshness::Fresh { .. }));

        tracker.record_failure("GT1");
        let status = tracker.status("GT1");
        assert!(status.is_stale());
        assert_eq!(status.value(), Some(Value::Temperature(21.5)));

        tracker.record_success("GT1", Value::Temperature(22.0));
        assert!(matches!(tracker.status("GT1"), Freshness::Fresh { .. }));
        assert_eq!(tracker.failures("GT1"), 0);
    }
}
