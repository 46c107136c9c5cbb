//! CLI Exit Codes
//!
//! Exit codes for the diagnostic binary, derived from core errors so scripts
//! can tell cabling problems from firmware drift.

use crate::config::ConfigError;
use crate::core::error::{CanError, ConnectionError, DiscoveryError, Error};
use std::any::Any;
use std::process::ExitCode;
use thiserror::Error as ThisError;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// Operation timed out
    pub const TIMEOUT: u8 = 4;

    /// Adapter initialization failed
    pub const INIT_FAILED: u8 = 5;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Permission denied (port in use)
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// CAN bus error
    pub const BUS_ERROR: u8 = 9;

    /// Element discovery failed
    pub const DISCOVERY_FAILED: u8 = 10;

    /// Device not found
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Device busy
    pub const DEVICE_BUSY: u8 = 13;

    /// Unknown parameter
    pub const UNKNOWN_PARAMETER: u8 = 14;

    /// No usable value
    pub const NO_VALUE: u8 = 15;

    /// Data validation failed
    pub const VALIDATION_FAILED: u8 = 17;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// Arguments that parsed but cannot be used
#[derive(Debug, ThisError)]
#[error("{0}")]
pub struct UsageError(pub String);

impl UsageError {
    /// Create from a message
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Success without message
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Error with explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Exit code for a core error
pub fn error_code(err: &Error) -> u8 {
    match err {
        Error::Connection(ConnectionError::DeviceNotFound(_)) => ExitCodes::DEVICE_NOT_FOUND,
        Error::Connection(ConnectionError::PermissionDenied(_)) => ExitCodes::PERMISSION_DENIED,
        Error::Connection(ConnectionError::InitializationFailed { .. }) => ExitCodes::INIT_FAILED,
        Error::Connection(ConnectionError::Disconnected(_)) => ExitCodes::CONNECTION_FAILED,
        Error::Timeout(_) => ExitCodes::TIMEOUT,
        Error::Can(CanError::MalformedFrame(_)) | Error::Codec(_) => ExitCodes::VALIDATION_FAILED,
        Error::Can(_) => ExitCodes::BUS_ERROR,
        Error::Concurrency(_) => ExitCodes::DEVICE_BUSY,
        Error::Discovery(DiscoveryError::Cache(_)) => ExitCodes::ERROR,
        Error::Discovery(_) => ExitCodes::DISCOVERY_FAILED,
        Error::UnknownParameter(_) => ExitCodes::UNKNOWN_PARAMETER,
        Error::NoValue { .. } => ExitCodes::NO_VALUE,
        Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
        Error::Io(_) => ExitCodes::ERROR,
    }
}

impl From<&Error> for CliResult {
    fn from(err: &Error) -> Self {
        Self::Error(error_code(err), err.to_string())
    }
}

impl From<&ConfigError> for CliResult {
    fn from(err: &ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

/// Map an `anyhow` error chain to a result, using the first core error found
pub fn from_anyhow(err: &anyhow::Error) -> CliResult {
    if let Some(core) = err.chain().find_map(|e| e.downcast_ref::<Error>()) {
        return CliResult::Error(error_code(core), format!("{err:#}"));
    }
    if let Some(config) = err.chain().find_map(|e| e.downcast_ref::<ConfigError>()) {
        return CliResult::from(config);
    }
    if err.chain().any(|e| e.is::<UsageError>()) {
        return CliResult::Error(ExitCodes::INVALID_ARGS, format!("{err:#}"));
    }
    CliResult::Error(ExitCodes::ERROR, format!("{err:#}"))
}

/// Result for a panic payload
pub fn internal_error(payload: &(dyn Any + Send)) -> CliResult {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string());
    CliResult::Error(ExitCodes::INTERNAL_ERROR, format!("internal error: {detail}"))
}

/// Exit with [`ExitCodes::INTERNAL_ERROR`] on panic, also under `panic = "abort"`
pub fn install_panic_hook() {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default(info);
        let result = internal_error(info.payload());
        eprintln!("error: {}", result.message().unwrap_or("internal error"));
        std::process::exit(i32::from(result.code()));
    }));
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Operation timed out",
        5 => "Adapter initialization failed",
        6 => "File not found",
        7 => "Permission denied (port in use)",
        8 => "Configuration error",
        9 => "CAN bus error",
        10 => "Element discovery failed",
        12 => "Device not found",
        13 => "Device busy",
        14 => "Unknown parameter",
        15 => "No usable value",
        17 => "Validation failed",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 12, 13, 14, 15, 17, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}
