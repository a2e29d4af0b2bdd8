//! Emulator error types.

use crate::config::ConfigError;
use crate::flash::FlashError;
use thiserror::Error;

/// Emulator errors.
#[derive(Debug, Error)]
pub enum EmuError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] spibridge_protocol::ProtocolError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("flash error: {0}")]
    Flash(#[from] FlashError),

    #[error("emulator shutting down")]
    ShuttingDown,
}
