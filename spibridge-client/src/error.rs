//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] spibridge_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("a transaction is already outstanding")]
    Busy,

    #[error("device reported failure for opcode {opcode:#04x} (status {status:#04x})")]
    DeviceError { opcode: u8, status: u8 },

    #[error("response length mismatch: expected {expected} bytes, bridge declared {declared}")]
    LengthMismatch { expected: u16, declared: u16 },

    #[error("request timeout")]
    Timeout,

    #[error("transport closed")]
    TransportClosed,

    #[error("invalid bridge address: {0}")]
    InvalidAddress(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ClientError {
    /// Returns whether retrying the same command may succeed.
    ///
    /// Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Busy | ClientError::Timeout)
    }

    /// Returns whether the connection is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::TransportClosed | ClientError::NotConnected
        )
    }
}
