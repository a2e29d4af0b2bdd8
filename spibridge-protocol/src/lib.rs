//! # spibridge-protocol
//!
//! Wire protocol for talking to a SPI flash chip through a serial bridge.
//!
//! This crate provides:
//! - Command frame encoding (6-byte little-endian header plus write payload)
//! - Response frame decoding bounded by the caller's expected read length
//! - A stream reassembler for arbitrarily chunked receive data
//! - Bridge-side decoding of command frames and encoding of responses
//! - The fixed SPI flash opcode vocabulary
//!
//! Nothing here performs I/O.

pub mod codec;
pub mod error;
pub mod frame;
pub mod opcodes;

pub use codec::{CommandDecoder, Reassembler};
pub use error::ProtocolError;
pub use frame::{
    Command, DecodedFrame, Response, Status, COMMAND_HEADER_SIZE, RESPONSE_HEADER_SIZE,
};

/// Default TCP port for network-attached bridges and the emulator.
pub const DEFAULT_BRIDGE_PORT: u16 = 7420;

/// Largest write payload or read length a frame header can express.
pub const MAX_TRANSFER_LEN: usize = u16::MAX as usize;
