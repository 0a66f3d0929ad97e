//! Opus decoder wrapper

use opus::Channels;

use super::Decoder;
use crate::audio::frame::AudioFrame;
use crate::error::CodecError;

/// 120 ms at 48 kHz, the longest frame Opus can produce
const MAX_DECODE_SAMPLES: usize = 48000 * 120 / 1000;

/// Mono Opus decoder
pub struct OpusDecoder {
    decoder: opus::Decoder,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32) -> Result<Self, CodecError> {
        let decoder = opus::Decoder::new(sample_rate, Channels::Mono)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            decode_buffer: vec![0i16; MAX_DECODE_SAMPLES],
        })
    }
}

impl Decoder for OpusDecoder {
    fn decode(&mut self, chunk: &[u8], emit: &mut dyn FnMut(AudioFrame)) -> Result<(), CodecError> {
        // An empty chunk carries nothing; libopus would treat it as loss
        if chunk.is_empty() {
            return Ok(());
        }

        let samples = self
            .decoder
            .decode(chunk, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        emit(AudioFrame::new(self.decode_buffer[..samples].to_vec()));
        Ok(())
    }
}
