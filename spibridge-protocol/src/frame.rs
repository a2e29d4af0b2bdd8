//! Bridge frame formats.
//!
//! Command frame (host to bridge), 6 bytes header + write payload:
//!
//! ```text
//! +--------+-----------+-----------+----------+-------------------+
//! | opcode | wait_busy | write_len | read_len | write payload     |
//! | 1 byte |  1 byte   | 2 (LE)    | 2 (LE)   | write_len bytes   |
//! +--------+-----------+-----------+----------+-------------------+
//! ```
//!
//! Response frame (bridge to host), 3 bytes header + data:
//!
//! ```text
//! +--------+--------------+---------------------+
//! | status | declared_len | data                |
//! | 1 byte | 2 (LE)       | declared_len bytes  |
//! +--------+--------------+---------------------+
//! ```
//!
//! Response frames are not self-bounding on the host side: a frame is only
//! considered complete once the number of data bytes the caller asked for has
//! arrived, and the declared length is then checked against that request.

use crate::error::ProtocolError;
use crate::MAX_TRANSFER_LEN;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the command frame header in bytes.
pub const COMMAND_HEADER_SIZE: usize = 6;

/// Size of the response frame header in bytes.
pub const RESPONSE_HEADER_SIZE: usize = 3;

/// Response status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The bridge executed the SPI transaction.
    Success,
    /// The bridge or the chip reported a failure.
    Error,
    /// A status code outside the known vocabulary. Treated as a failure.
    Other(u8),
}

impl Status {
    pub const SUCCESS_CODE: u8 = 0x00;
    pub const ERROR_CODE: u8 = 0x01;

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            Self::SUCCESS_CODE => Status::Success,
            Self::ERROR_CODE => Status::Error,
            other => Status::Other(other),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Status::Success => Self::SUCCESS_CODE,
            Status::Error => Self::ERROR_CODE,
            Status::Other(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

/// A single SPI transaction request.
///
/// The bridge clocks out `opcode` followed by `write_data`, then clocks in
/// `read_len` bytes. If `wait_busy` is set the bridge polls the chip's busy
/// bit before replying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: u8,
    wait_busy: bool,
    write_data: Bytes,
    read_len: u16,
}

impl Command {
    /// Creates a command that writes nothing and reads nothing.
    pub fn new(opcode: u8) -> Self {
        Self {
            opcode,
            wait_busy: false,
            write_data: Bytes::new(),
            read_len: 0,
        }
    }

    /// Creates a command that reads `len` bytes after the opcode.
    pub fn read(opcode: u8, len: u16) -> Self {
        Self::new(opcode).with_read_len(len)
    }

    /// Creates a command that writes `data` after the opcode.
    pub fn write(opcode: u8, data: impl Into<Bytes>) -> Self {
        Self::new(opcode).with_write_data(data)
    }

    pub fn with_wait_busy(mut self) -> Self {
        self.wait_busy = true;
        self
    }

    pub fn with_write_data(mut self, data: impl Into<Bytes>) -> Self {
        self.write_data = data.into();
        self
    }

    pub fn with_read_len(mut self, len: u16) -> Self {
        self.read_len = len;
        self
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn wait_busy(&self) -> bool {
        self.wait_busy
    }

    pub fn write_data(&self) -> &Bytes {
        &self.write_data
    }

    /// Number of response data bytes the caller expects.
    pub fn read_len(&self) -> u16 {
        self.read_len
    }

    /// Encodes only the 6-byte header.
    pub fn encode_header(&self) -> Result<[u8; COMMAND_HEADER_SIZE], ProtocolError> {
        let write_len = self.write_data.len();
        if write_len > MAX_TRANSFER_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                size: write_len,
                max: MAX_TRANSFER_LEN,
            });
        }
        let write_len = (write_len as u16).to_le_bytes();
        let read_len = self.read_len.to_le_bytes();

        Ok([
            self.opcode,
            u8::from(self.wait_busy),
            write_len[0],
            write_len[1],
            read_len[0],
            read_len[1],
        ])
    }

    /// Encodes the full frame (header followed by write payload).
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let header = self.encode_header()?;
        let mut buf = BytesMut::with_capacity(COMMAND_HEADER_SIZE + self.write_data.len());
        buf.put_slice(&header);
        buf.put_slice(&self.write_data);
        Ok(buf)
    }

    /// Decodes a command frame from the front of `buf`.
    ///
    /// Used on the bridge side. Returns `Ok(None)` if more data is needed;
    /// on success exactly one frame is consumed from the buffer.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < COMMAND_HEADER_SIZE {
            return Ok(None);
        }

        let opcode = buf[0];
        let wait_busy = match buf[1] {
            0x00 => false,
            0x01 => true,
            other => return Err(ProtocolError::InvalidWaitBusyFlag(other)),
        };
        let write_len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        let read_len = u16::from_le_bytes([buf[4], buf[5]]);

        if buf.len() < COMMAND_HEADER_SIZE + write_len {
            return Ok(None);
        }

        buf.advance(COMMAND_HEADER_SIZE);
        let write_data = buf.split_to(write_len).freeze();

        Ok(Some(Self {
            opcode,
            wait_busy,
            write_data,
            read_len,
        }))
    }
}

/// A response frame as produced by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub payload: Bytes,
}

impl Response {
    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self {
            status: Status::Success,
            payload: payload.into(),
        }
    }

    /// An error response with no data.
    pub fn error() -> Self {
        Self {
            status: Status::Error,
            payload: Bytes::new(),
        }
    }

    /// Pads the payload with `0xFF` up to `len` bytes, the way a bridge fills
    /// a reply whose transfer was cut short.
    pub fn padded_to(mut self, len: u16) -> Self {
        let len = len as usize;
        if self.payload.len() < len {
            let mut payload = BytesMut::with_capacity(len);
            payload.put_slice(&self.payload);
            payload.resize(len, 0xFF);
            self.payload = payload.freeze();
        }
        self
    }

    /// Encodes the response into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let len = self.payload.len();
        if len > MAX_TRANSFER_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: MAX_TRANSFER_LEN,
            });
        }

        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_SIZE + len);
        buf.put_u8(self.status.as_byte());
        buf.put_u16_le(len as u16);
        buf.put_slice(&self.payload);
        Ok(buf)
    }
}

/// A response frame decoded on the host side, not yet validated against
/// the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub status: Status,
    /// Length field as sent by the bridge.
    pub declared_len: u16,
    /// Data bytes `3..3 + min(declared_len, expected_len)`.
    pub payload: Bytes,
}

impl DecodedFrame {
    /// Attempts to decode a response from accumulated bytes.
    ///
    /// Returns `None` while fewer than `RESPONSE_HEADER_SIZE + expected_len`
    /// bytes are present. A failure status completes the frame early, once
    /// the header and `min(declared_len, expected_len)` data bytes are in.
    /// The result depends only on those bytes, never on how much else is
    /// buffered. The input is never modified.
    pub fn try_decode(buf: &[u8], expected_len: u16) -> Option<Self> {
        if buf.len() < RESPONSE_HEADER_SIZE {
            return None;
        }

        let status = Status::from_byte(buf[0]);
        let declared_len = u16::from_le_bytes([buf[1], buf[2]]);

        let needed = if status.is_success() {
            expected_len
        } else {
            declared_len.min(expected_len)
        };
        if buf.len() < RESPONSE_HEADER_SIZE + needed as usize {
            return None;
        }

        let end = RESPONSE_HEADER_SIZE + declared_len.min(expected_len) as usize;
        let payload = Bytes::copy_from_slice(&buf[RESPONSE_HEADER_SIZE..end]);

        Some(Self {
            status,
            declared_len,
            payload,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Bytes this frame occupies on the wire for a request expecting
    /// `expected_len` data bytes.
    ///
    /// A bridge always sends at least what it declares and pads replies up to
    /// the requested length, failures included. Anything past
    /// [`RESPONSE_HEADER_SIZE`] + `payload.len()` that has not arrived yet
    /// still belongs to this frame.
    pub fn wire_len(&self, expected_len: u16) -> usize {
        RESPONSE_HEADER_SIZE + self.declared_len.max(expected_len) as usize
    }
}
