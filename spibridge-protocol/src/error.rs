//! Protocol error types.

use thiserror::Error;

/// Errors that can occur while building or parsing bridge frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("invalid wait-busy flag: {0:#04x}")]
    InvalidWaitBusyFlag(u8),
}
