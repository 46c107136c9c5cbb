//! Application settings

use crate::core::broadcast::BroadcastKey;
use crate::core::client::ClientConfig;
use crate::core::codec::Bitrate;
use crate::core::connection::ConnectionConfig;
use crate::core::discovery::{DiscoveryConfig, MAX_CHUNK_SIZE};
use crate::core::state_machine::BackoffPolicy;
use crate::core::transport::AdapterConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Configuration load/save failures
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No platform config directory
    #[error("could not determine config directory")]
    NoConfigDir,

    /// File could not be read or written
    #[error("{path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("{path}: {source}")]
    Parse {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: toml::de::Error,
    },

    /// Settings could not be serialized
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),
}

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Adapter link
    pub adapter: AdapterSettings,
    /// Automatic reconnection
    pub reconnect: ReconnectSettings,
    /// Element discovery
    pub discovery: DiscoverySettings,
    /// Broadcast fallback
    pub broadcast: BroadcastSettings,
    /// Last-known-good tracking
    pub freshness: FreshnessSettings,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load config from the default location; defaults when missing
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        Self::load_from(&path)
    }

    /// Load config from a file; defaults when missing
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save config to a file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_err)
    }

    /// Connection settings
    pub fn connection(&self) -> ConnectionConfig {
        let adapter = AdapterConfig::new(&self.adapter.port, self.adapter.baud_rate)
            .bitrate(self.adapter.bitrate)
            .timeout(Duration::from_millis(self.adapter.timeout_ms));
        ConnectionConfig::new(adapter)
            .auto_reconnect(self.reconnect.enabled)
            .backoff(BackoffPolicy {
                initial_delay: Duration::from_secs(self.reconnect.initial_delay_secs),
                max_delay: Duration::from_secs(self.reconnect.max_delay_secs),
            })
    }

    /// Discovery settings; the cache defaults to the platform cache dir
    pub fn discovery(&self) -> DiscoveryConfig {
        let d = &self.discovery;
        DiscoveryConfig {
            cache_path: d.cache_path.clone().or_else(super::discovery_cache_file),
            max_cache_age: Duration::from_secs(d.max_age_hours * 3600),
            attempts: d.attempts,
            retry_delay: Duration::from_millis(d.retry_delay_ms),
            chunk_size: d.chunk_size,
            chunk_timeout: Duration::from_millis(d.chunk_timeout_ms),
            completeness_percent: d.completeness_percent,
        }
    }

    /// Client settings; broadcast keys no frame can carry are skipped
    pub fn client(&self) -> ClientConfig {
        let broadcast_keys = self
            .broadcast
            .keys
            .iter()
            .filter(|(name, key)| {
                let usable = key.is_addressable();
                if !usable {
                    warn!(
                        name = %name,
                        base = format_args!("{:#010X}", key.base),
                        index = key.index,
                        "ignoring unusable broadcast key"
                    );
                }
                usable
            })
            .map(|(name, key)| (name.clone(), *key))
            .collect();
        ClientConfig {
            timeout: Duration::from_millis(self.adapter.timeout_ms),
            fallback_window: Duration::from_millis(self.broadcast.fallback_window_ms),
            stale_after: self.freshness.stale_after,
            broadcast_keys,
        }
    }
}

/// Adapter link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    /// Serial port name
    pub port: String,
    /// Serial baud rate
    pub baud_rate: u32,
    /// CAN bitrate
    pub bitrate: Bitrate,
    /// Per-operation timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            port: if cfg!(windows) { "COM3" } else { "/dev/ttyACM0" }.to_string(),
            baud_rate: 115_200,
            bitrate: Bitrate::default(),
            timeout_ms: 2000,
        }
    }
}

/// Automatic reconnection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Reconnect after link failures
    pub enabled: bool,
    /// First delay in seconds
    pub initial_delay_secs: u64,
    /// Delay cap in seconds
    pub max_delay_secs: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_secs: 5,
            max_delay_secs: 300,
        }
    }
}

/// Discovery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Cache file; platform cache dir when unset
    pub cache_path: Option<PathBuf>,
    /// Cache age limit in hours
    pub max_age_hours: u64,
    /// Transfer attempts
    pub attempts: u32,
    /// Pause between attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Bytes per chunk (at most 4096)
    pub chunk_size: usize,
    /// Time allowed per chunk in milliseconds
    pub chunk_timeout_ms: u64,
    /// Share of reported bytes an attempt must deliver
    pub completeness_percent: u8,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            cache_path: None,
            max_age_hours: 24,
            attempts: 3,
            retry_delay_ms: 2000,
            chunk_size: MAX_CHUNK_SIZE,
            chunk_timeout_ms: 2000,
            completeness_percent: 95,
        }
    }
}

/// Broadcast fallback settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    /// Collection window in milliseconds
    pub fallback_window_ms: u64,
    /// Broadcasts carrying parameters off their response identifier, by name
    ///
    /// ```toml
    /// [broadcast.keys]
    /// GT1_T = { base = 0x1C003FE0, index = 66 }
    /// ```
    pub keys: BTreeMap<String, BroadcastKey>,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            fallback_window_ms: 5000,
            keys: BTreeMap::new(),
        }
    }
}

/// Last-known-good settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessSettings {
    /// Consecutive failures before a value is stale
    pub stale_after: u32,
}

impl Default for FreshnessSettings {
    fn default() -> Self {
        Self {
            stale_after: crate::core::freshness::DEFAULT_STALE_AFTER,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax), overridden by `RUST_LOG`
    pub level: String,
    /// JSON lines instead of human readable output
    pub json: bool,
    /// Also write a daily-rolling log file
    pub file: bool,
    /// Log directory; platform data dir when unset
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: false,
            directory: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.adapter.baud_rate, 115_200);
        assert_eq!(config.connection().backoff.initial_delay, Duration::from_secs(5));
        assert_eq!(config.connection().backoff.max_delay, Duration::from_secs(300));
        assert_eq!(config.discovery().attempts, 3);
        assert_eq!(config.client().fallback_window, Duration::from_secs(5));
        assert_eq!(config.client().stale_after, 3);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[adapter]\nport = \"/dev/ttyUSB1\"\nbitrate = \"250k\"\n").unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.adapter.port, "/dev/ttyUSB1");
        assert_eq!(config.adapter.bitrate, Bitrate::K250);
        assert_eq!(config.adapter.timeout_ms, 2000);
        assert!(config.reconnect.enabled);
    }

    #[test]
    fn test_broadcast_keys_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[broadcast.keys]\nGT1_T = { base = 0x1C003FE0, index = 66 }\nGT2_T = { base = 0x1C007FE0, index = 2 }\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.broadcast.fallback_window_ms, 5000);
        assert_eq!(config.broadcast.keys.len(), 2);

        let client = config.client();
        assert_eq!(client.broadcast_keys.get("GT1_T"), Some(&BroadcastKey::new(0x1C00_3FE0, 66)));
        // index bits set in the base: no frame splits into that key
        assert!(!client.broadcast_keys.contains_key("GT2_T"));
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.toml");
        assert_eq!(AppConfig::load_from(&missing).unwrap(), AppConfig::default());

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[adapter\n").unwrap();
        assert!(matches!(AppConfig::load_from(&bad), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");
        let mut config = AppConfig::default();
        config.discovery.attempts = 5;
        config.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
    }
}
