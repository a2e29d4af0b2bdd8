//! Stream reassembly for bridge frames.
//!
//! The transport hands out receive data in chunks of arbitrary size. The
//! [`Reassembler`] accumulates them for the host side; [`CommandDecoder`]
//! does the same for the bridge side.

use crate::error::ProtocolError;
use crate::frame::{Command, DecodedFrame};
use bytes::{Bytes, BytesMut};

/// Default initial capacity of the accumulation buffers.
const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Host-side accumulation buffer for response frames.
///
/// Response frames carry no delimiter the host can trust, so the
/// reassembler needs the outstanding request's expected read length to know
/// when a frame is complete. Whatever is buffered when a frame completes is
/// dropped along with it.
pub struct Reassembler {
    buffer: BytesMut,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends a received chunk.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Appends a received chunk held in `Bytes`.
    pub fn feed_bytes(&mut self, chunk: Bytes) {
        self.buffer.extend_from_slice(&chunk);
    }

    /// Attempts to extract the response for a request expecting
    /// `expected_len` data bytes.
    ///
    /// Returns `None` and leaves the buffer untouched while the frame is
    /// incomplete. Once a frame is produced the buffer is emptied, whether or
    /// not the frame later validates.
    pub fn try_frame(&mut self, expected_len: u16) -> Option<DecodedFrame> {
        let frame = DecodedFrame::try_decode(&self.buffer, expected_len)?;
        self.buffer.clear();
        Some(frame)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the accumulation buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridge-side decoder for command frames.
pub struct CommandDecoder {
    buffer: BytesMut,
}

impl CommandDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next command from the buffer.
    pub fn decode_command(&mut self) -> Result<Option<Command>, ProtocolError> {
        Command::decode(&mut self.buffer)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for CommandDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Response, Status};
    use crate::opcodes;
    use crate::RESPONSE_HEADER_SIZE;
    use proptest::prelude::*;

    const SCENARIO: [u8; 7] = [0x00, 0x04, 0x00, 0xDE, 0xAD, 0xBE, 0xEF];

    #[test]
    fn test_reassembler_two_chunks() {
        let mut reassembler = Reassembler::new();

        reassembler.feed(&[0x00, 0x04]);
        assert!(reassembler.try_frame(4).is_none());
        assert_eq!(reassembler.buffered(), 2);

        reassembler.feed(&[0x00, 0xDE, 0xAD, 0xBE, 0xEF]);
        let frame = reassembler.try_frame(4).unwrap();
        assert_eq!(&frame.payload[..], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn test_reassembler_clears_on_failed_frame() {
        let mut reassembler = Reassembler::new();
        reassembler.feed(&[0x01, 0x00, 0x00, 0xFF, 0xFF]);

        let frame = reassembler.try_frame(2).unwrap();
        assert_eq!(frame.status, Status::Error);
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn test_reassembler_discards_trailing_bytes() {
        let mut reassembler = Reassembler::new();
        let mut data = SCENARIO.to_vec();
        data.extend_from_slice(&[0x99, 0x98]);
        reassembler.feed_bytes(Bytes::from(data));

        let frame = reassembler.try_frame(4).unwrap();
        assert_eq!(frame.declared_len, 4);
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn test_reassembler_incomplete_has_no_side_effect() {
        let mut reassembler = Reassembler::default();
        reassembler.feed(&SCENARIO[..5]);
        assert!(reassembler.try_frame(4).is_none());
        assert!(reassembler.try_frame(4).is_none());
        assert_eq!(reassembler.buffered(), 5);

        reassembler.clear();
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn test_command_decoder_multiple_frames() {
        let first = Command::new(opcodes::WRITE_ENABLE);
        let second = Command::read(opcodes::JEDEC_ID, 3);

        let mut decoder = CommandDecoder::new();
        decoder.extend(&first.encode().unwrap());
        decoder.extend(&second.encode().unwrap());

        assert_eq!(decoder.decode_command().unwrap(), Some(first));
        assert_eq!(decoder.decode_command().unwrap(), Some(second));
        assert_eq!(decoder.decode_command().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_command_decoder_partial() {
        let cmd = Command::write(opcodes::PAGE_PROGRAM, vec![0x00, 0x10, 0x00, 0xAB]);
        let encoded = cmd.encode().unwrap();

        let mut decoder = CommandDecoder::default();
        decoder.extend(&encoded[..3]);
        assert_eq!(decoder.decode_command().unwrap(), None);

        decoder.extend(&encoded[3..]);
        assert_eq!(decoder.decode_command().unwrap(), Some(cmd));
    }

    #[test]
    fn test_response_through_reassembler() {
        let encoded = Response::ok(vec![0x11, 0x22]).encode().unwrap();
        let mut reassembler = Reassembler::new();
        reassembler.feed(&encoded);

        let frame = reassembler.try_frame(2).unwrap();
        assert!(frame.is_success());
        assert_eq!(&frame.payload[..], &[0x11, 0x22]);
    }

    /// Feeds `wire` in pieces cut at `cuts` and returns the first frame the
    /// reassembler produces, with the number of bytes fed so far.
    fn feed_in_pieces(
        wire: &[u8],
        cuts: &[prop::sample::Index],
        expected_len: u16,
    ) -> Option<(DecodedFrame, usize)> {
        let mut points: Vec<usize> = cuts.iter().map(|i| i.index(wire.len() + 1)).collect();
        points.push(0);
        points.push(wire.len());
        points.sort_unstable();
        points.dedup();

        let mut reassembler = Reassembler::new();
        for window in points.windows(2) {
            reassembler.feed(&wire[window[0]..window[1]]);
            if let Some(frame) = reassembler.try_frame(expected_len) {
                return Some((frame, window[1]));
            }
        }
        None
    }

    #[test]
    fn test_error_frame_owes_padding() {
        let mut reassembler = Reassembler::new();
        reassembler.feed(&[0x01, 0x00, 0x00]);

        let frame = reassembler.try_frame(2).unwrap();
        assert_eq!(frame.wire_len(2), 5);
        assert!(frame.payload.is_empty());
    }

    proptest! {
        #[test]
        fn prop_fragmentation_invariance(
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let encoded = Response::ok(payload.clone()).encode().unwrap();
            let expected_len = payload.len() as u16;

            let mut whole = Reassembler::new();
            whole.feed(&encoded);
            let reference = whole.try_frame(expected_len).unwrap();

            let result = feed_in_pieces(&encoded, &cuts, expected_len);
            prop_assert_eq!(result, Some((reference, encoded.len())));
        }

        #[test]
        fn prop_any_frame_is_chunking_invariant(
            status in prop_oneof![Just(Status::SUCCESS_CODE), Just(Status::ERROR_CODE), any::<u8>()],
            declared in 0u16..300,
            expected_len in 0u16..300,
            body in proptest::collection::vec(any::<u8>(), 300..320),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            // Header, then at least the full body the frame spans, then junk.
            let mut wire = vec![status];
            wire.extend_from_slice(&declared.to_le_bytes());
            wire.extend_from_slice(&body);

            let mut whole = Reassembler::new();
            whole.feed(&wire);
            let reference = whole.try_frame(expected_len).unwrap();
            prop_assert_eq!(whole.buffered(), 0);
            prop_assert_eq!(reference.payload.len(), declared.min(expected_len) as usize);

            let (frame, fed) = feed_in_pieces(&wire, &cuts, expected_len).unwrap();
            prop_assert_eq!(&frame, &reference);

            // Completion never needs more than the frame occupies, and whatever
            // of it had not arrived is accounted for by `wire_len`.
            let wire_len = frame.wire_len(expected_len);
            prop_assert!(wire_len >= RESPONSE_HEADER_SIZE + frame.payload.len());
            if status == Status::SUCCESS_CODE {
                prop_assert!(fed >= RESPONSE_HEADER_SIZE + expected_len as usize);
            } else {
                prop_assert!(fed >= RESPONSE_HEADER_SIZE + declared.min(expected_len) as usize);
            }
        }
    }
}
