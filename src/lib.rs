//! # Heatlink Core Library
//!
//! Talks to a heat-pump controller over CAN through an SLCAN USB-serial
//! adapter:
//! - SLCAN line codec and parameter value formats
//! - Adapter transport with initialization, ack/nak handling and bus status
//! - Supervised connection with manual override and backoff reconnection
//! - Element discovery (chunked table transfer, completeness check, cache)
//! - Broadcast monitor as the fallback read path
//!
//! ## Example
//!
//! ```rust,no_run
//! use heatlink_core::{ClientConfig, Connection, Discovery, DiscoveryConfig, ElementRegistry, HeatPump, Param, ValueFormat};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let conn = Connection::connect("/dev/ttyACM0", 115_200, Duration::from_secs(2)).await?;
//!
//!     let registry = ElementRegistry::new();
//!     Discovery::new(conn.clone(), registry.clone(), DiscoveryConfig::default())
//!         .run(false)
//!         .await?;
//!
//!     let pump = HeatPump::new(conn, registry, ClientConfig::default());
//!     let reading = pump.read_value(&Param::from("GT1_T"), ValueFormat::Temp).await?;
//!     println!("{} = {} ({})", reading.name, reading.value, reading.source);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;
pub mod utils;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::AppConfig;
pub use crate::core::broadcast::{BroadcastMonitor, BroadcastReading, CacheSnapshot};
pub use crate::core::client::{Ack, ClientConfig, HeatPump, Param, Reading, ValueSource};
pub use crate::core::codec::{Bitrate, Value, ValueFormat};
pub use crate::core::connection::{Connection, ConnectionConfig};
pub use crate::core::discovery::{DiscoveredElement, Discovery, DiscoveryConfig, DiscoveryOutcome, ElementRegistry};
pub use crate::core::error::{Error, Result};
pub use crate::core::frame::CanFrame;
pub use crate::core::freshness::Freshness;
pub use crate::core::state_machine::ConnectionState;
pub use crate::core::transport::{AdapterConfig, ReplayTransport, SerialTransport, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
