//! Configuration module
//!
//! Handles application settings and platform directories

mod settings;

pub use settings::{
    AdapterSettings, AppConfig, BroadcastSettings, ConfigError, DiscoverySettings, FreshnessSettings,
    LoggingConfig, ReconnectSettings,
};

use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "heatlink", "Heatlink")
}

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application cache directory
pub fn cache_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.cache_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

/// Default config file location
pub fn config_file() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Default discovery cache location
pub fn discovery_cache_file() -> Option<PathBuf> {
    cache_dir().map(|d| d.join("elements.json"))
}

/// Get the log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}
