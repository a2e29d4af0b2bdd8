//! # spibridge-client
//!
//! Host-side engine for driving a SPI flash chip through a serial bridge.
//!
//! This crate provides:
//! - A connection that admits one outstanding transaction at a time and
//!   reassembles chunked responses
//! - TCP and Unix socket transports, or any caller-supplied byte stream
//! - Flash helpers (identify, read, program, erase, reset) on top of raw
//!   commands

pub mod client;
pub mod connection;
pub mod error;
pub mod stream;

pub use client::{Client, JedecId};
pub use connection::{Connection, ConnectionConfig, IdleBytePolicy, PendingResponse};
pub use error::ClientError;
pub use stream::{BridgeAddr, BridgeStream};
