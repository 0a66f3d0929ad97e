//! Wire framing for encoded audio chunks
//!
//! TCP is a byte stream, so every chunk travels with a fixed-size binary
//! length prefix:
//!
//! ```text
//! ┌──────────────────┬───────────────────────────┐
//! │ len: u16 (BE)    │ payload: len bytes        │
//! └──────────────────┴───────────────────────────┘
//! ```
//!
//! The same format is produced and consumed by the client link and by the
//! relay, which reassembles whole frames per connection before fanning them
//! out so that chunks from different speakers never interleave mid-frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_CHUNK_SIZE;
use crate::error::NetworkError;

/// Size of the length prefix in bytes
pub const HEADER_LEN: usize = 2;

/// Wrap a payload in a length-prefixed frame
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, NetworkError> {
    if payload.len() > MAX_CHUNK_SIZE {
        return Err(NetworkError::PacketTooLarge(payload.len()));
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u16(payload.len() as u16);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Incremental decoder for a stream of length-prefixed frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(HEADER_LEN + MAX_CHUNK_SIZE),
        }
    }

    /// Append raw bytes read from the socket
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take the next complete payload, if one is buffered.
    ///
    /// A header announcing more than [`MAX_CHUNK_SIZE`] bytes is a protocol
    /// violation; the stream cannot be resynchronised after it.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, NetworkError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if len > MAX_CHUNK_SIZE {
            return Err(NetworkError::PacketTooLarge(len));
        }
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buffer.advance(HEADER_LEN);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }

    /// Bytes buffered but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(b"X0123").unwrap();
        assert_eq!(&frame[..], &[0, 5, b'X', b'0', b'1', b'2', b'3']);
    }

    #[test]
    fn test_partial_header_and_payload() {
        let frame = encode_frame(b"hello").unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.extend(&frame[..1]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&frame[1..4]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.extend(&frame[4..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_several_frames_in_one_read() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(b"a").unwrap());
        wire.extend_from_slice(&encode_frame(b"").unwrap());
        wire.extend_from_slice(&encode_frame(b"bc").unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.extend(&wire);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), Bytes::from_static(b"a"));
        assert!(decoder.next_frame().unwrap().unwrap().is_empty());
        assert_eq!(decoder.next_frame().unwrap().unwrap(), Bytes::from_static(b"bc"));
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let big = vec![0u8; MAX_CHUNK_SIZE + 1];
        assert!(matches!(encode_frame(&big), Err(NetworkError::PacketTooLarge(_))));

        let mut decoder = FrameDecoder::new();
        decoder.extend(&((MAX_CHUNK_SIZE + 1) as u16).to_be_bytes());
        assert!(decoder.next_frame().is_err());
    }

    proptest! {
        #[test]
        fn arbitrary_read_boundaries_preserve_chunks(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..16),
            split in 1usize..32,
        ) {
            let mut wire = Vec::new();
            for chunk in &chunks {
                wire.extend_from_slice(&encode_frame(chunk).unwrap());
            }

            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            for piece in wire.chunks(split) {
                decoder.extend(piece);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    decoded.push(frame.to_vec());
                }
            }

            prop_assert_eq!(decoded, chunks);
        }
    }
}
