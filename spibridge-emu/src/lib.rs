//! # spibridge-emu
//!
//! Software stand-in for a SPI flash bridge.
//!
//! This crate provides:
//! - An in-memory SPI NOR flash model driven by raw opcodes
//! - A TCP server speaking the bridge wire protocol
//! - In-process pipes for exercising hosts without hardware
//! - YAML + environment configuration for the daemon

pub mod config;
pub mod error;
pub mod flash;
pub mod server;

pub use config::{Config, ConfigError, FlashSettings, NetworkConfig};
pub use error::EmuError;
pub use flash::{EmulatedFlash, FlashConfig, FlashError};
pub use server::{
    serve_stream, spawn_duplex, spawn_duplex_shared, BridgeServer, ServerConfig, ServerStats,
    SharedFlash,
};
