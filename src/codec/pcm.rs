//! Pass-through PCM codec (little-endian i16)

use bytes::{BufMut, Bytes, BytesMut};

use super::{Decoder, Encoder};
use crate::audio::frame::AudioFrame;
use crate::error::CodecError;

/// Serializes frames verbatim
pub struct PcmEncoder {
    block_size: usize,
}

impl PcmEncoder {
    pub fn new(block_size: usize) -> Self {
        Self { block_size }
    }
}

impl Encoder for PcmEncoder {
    fn encode(&mut self, frame: &AudioFrame, emit: &mut dyn FnMut(Bytes)) -> Result<(), CodecError> {
        if frame.len() != self.block_size {
            return Err(CodecError::InvalidFrameSize(frame.len()));
        }

        let mut chunk = BytesMut::with_capacity(frame.len() * 2);
        for &sample in &frame.samples {
            chunk.put_i16_le(sample);
        }
        emit(chunk.freeze());
        Ok(())
    }
}

/// Parses chunks produced by [`PcmEncoder`]
#[derive(Default)]
pub struct PcmDecoder;

impl PcmDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for PcmDecoder {
    fn decode(&mut self, chunk: &[u8], emit: &mut dyn FnMut(AudioFrame)) -> Result<(), CodecError> {
        if chunk.len() % 2 != 0 {
            return Err(CodecError::DecodingFailed(format!(
                "odd PCM chunk length {}",
                chunk.len()
            )));
        }
        if chunk.is_empty() {
            return Ok(());
        }

        let samples = chunk
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        emit(AudioFrame::new(samples));
        Ok(())
    }
}
