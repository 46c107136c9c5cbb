//! Core protocol stack
//!
//! Leaves first:
//! - Frame codec: SLCAN lines and scalar value formats
//! - Transport: byte link and adapter initialization (serial or replay)
//! - Connection: lifecycle state machine, serialization lock, reconnection
//! - Discovery: chunked element table transfer, registry and cache
//! - Broadcast monitor: passive most-recent-wins value cache
//! - Client: parameter reads and writes with broadcast fallback

pub mod broadcast;
pub mod client;
pub mod codec;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod freshness;
pub mod state_machine;
pub mod transport;
