//! Audio codec collaborators
//!
//! The transport core never looks inside a chunk. It talks to codecs
//! through two order-preserving, callback-emitting traits so that a codec
//! may produce zero, one or several outputs per input without the caller
//! caring about buffering.

pub mod decoder;
pub mod encoder;
pub mod pcm;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::audio::frame::AudioFrame;
use crate::config::AudioConfig;
use crate::error::CodecError;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;
pub use pcm::{PcmDecoder, PcmEncoder};

/// Turns PCM frames into compressed chunks
pub trait Encoder: Send {
    /// Encode one frame, handing every resulting chunk to `emit` in order.
    fn encode(&mut self, frame: &AudioFrame, emit: &mut dyn FnMut(Bytes)) -> Result<(), CodecError>;
}

/// Turns compressed chunks back into PCM frames
pub trait Decoder: Send {
    /// Decode one chunk, handing every resulting frame to `emit` in order.
    fn decode(&mut self, chunk: &[u8], emit: &mut dyn FnMut(AudioFrame)) -> Result<(), CodecError>;
}

/// Codec used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Opus, VoIP tuning, mono
    Opus,
    /// Raw little-endian i16, no compression
    Pcm,
}

/// Sample rates libopus accepts
const OPUS_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Legal Opus frame durations, in units of 2.5 ms
const OPUS_FRAME_UNITS: [usize; 6] = [1, 2, 4, 8, 16, 24];

impl CodecKind {
    /// Whether this codec can encode frames of `block_size` samples at `sample_rate`
    pub fn supports_block(self, sample_rate: u32, block_size: usize) -> bool {
        match self {
            CodecKind::Pcm => true,
            CodecKind::Opus => {
                let rate = sample_rate as usize;
                OPUS_SAMPLE_RATES.contains(&sample_rate)
                    && (block_size * 400) % rate == 0
                    && OPUS_FRAME_UNITS.contains(&(block_size * 400 / rate))
            }
        }
    }
}

/// Build the encoder/decoder pair described by `config`
pub fn create_codec(config: &AudioConfig) -> Result<(Box<dyn Encoder>, Box<dyn Decoder>), CodecError> {
    if !config.codec.supports_block(config.sample_rate, config.block_size) {
        return Err(CodecError::InvalidFrameSize(config.block_size));
    }

    match config.codec {
        CodecKind::Opus => {
            let encoder = OpusEncoder::voice(config.sample_rate, config.block_size, config.bitrate)?;
            let decoder = OpusDecoder::new(config.sample_rate)?;
            tracing::info!(
                "Opus codec initialized: {} Hz mono, {} samples/frame ({:.1} ms), {} bps",
                config.sample_rate,
                config.block_size,
                encoder.frame_duration_ms(),
                config.bitrate
            );
            Ok((Box::new(encoder), Box::new(decoder)))
        }
        CodecKind::Pcm => Ok((
            Box::new(PcmEncoder::new(config.block_size)),
            Box::new(PcmDecoder::new()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opus_block_sizes() {
        assert!(CodecKind::Opus.supports_block(48000, 960));
        assert!(CodecKind::Opus.supports_block(48000, 120));
        assert!(CodecKind::Opus.supports_block(16000, 320));
        assert!(!CodecKind::Opus.supports_block(48000, 1024));
        assert!(!CodecKind::Opus.supports_block(44100, 441));
        assert!(CodecKind::Pcm.supports_block(44100, 1024));
    }

    #[test]
    fn test_create_pcm_codec() {
        let config = AudioConfig {
            codec: CodecKind::Pcm,
            block_size: 4,
            ..Default::default()
        };
        let (mut encoder, mut decoder) = create_codec(&config).unwrap();

        let mut chunks = Vec::new();
        encoder
            .encode(&AudioFrame::new(vec![1, -1, 2, -2]), &mut |chunk| chunks.push(chunk))
            .unwrap();
        assert_eq!(chunks.len(), 1);

        let mut frames = Vec::new();
        decoder.decode(&chunks[0], &mut |frame| frames.push(frame)).unwrap();
        assert_eq!(frames, vec![AudioFrame::new(vec![1, -1, 2, -2])]);
    }
}
