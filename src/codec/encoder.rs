//! Opus encoder wrapper
//!
//! Mono VoIP encoding, one chunk per frame.

use bytes::Bytes;
use opus::{Application, Bitrate, Channels};

use super::Encoder;
use crate::audio::frame::AudioFrame;
use crate::error::CodecError;

/// Max Opus packet is about 1275 bytes; leave headroom
const ENCODE_BUFFER_SIZE: usize = 4000;

/// Opus encoder tuned for speech
pub struct OpusEncoder {
    encoder: opus::Encoder,
    sample_rate: u32,
    frame_size: usize,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
}

impl OpusEncoder {
    /// Create a voice encoder for `frame_size` mono samples per frame
    pub fn voice(sample_rate: u32, frame_size: usize, bitrate: u32) -> Result<Self, CodecError> {
        let mut encoder = opus::Encoder::new(sample_rate, Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(true)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        // The transport is TCP, so in-band FEC would only cost bandwidth
        encoder
            .set_inband_fec(false)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        Ok(Self {
            encoder,
            sample_rate,
            frame_size,
            encode_buffer: vec![0u8; ENCODE_BUFFER_SIZE],
        })
    }

    /// Frame duration in milliseconds
    pub fn frame_duration_ms(&self) -> f32 {
        self.frame_size as f32 * 1000.0 / self.sample_rate as f32
    }
}

impl Encoder for OpusEncoder {
    fn encode(&mut self, frame: &AudioFrame, emit: &mut dyn FnMut(Bytes)) -> Result<(), CodecError> {
        if frame.len() != self.frame_size {
            return Err(CodecError::InvalidFrameSize(frame.len()));
        }

        let size = self
            .encoder
            .encode(&frame.samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        emit(Bytes::copy_from_slice(&self.encode_buffer[..size]));
        Ok(())
    }
}
