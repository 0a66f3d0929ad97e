//! PCM frames and the adapters between device buffers and fixed frames
//!
//! Devices hand out buffers of whatever size and channel count the host
//! picked. The rest of the crate works in fixed-size mono i16 frames, so
//! [`FrameAssembler`] slices input buffers into frames and
//! [`PlaybackCursor`] spreads frames back across output buffers.

/// Fixed-size block of mono 16-bit samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// All-zero frame of `block_size` samples
    pub fn silence(block_size: usize) -> Self {
        Self {
            samples: vec![0; block_size],
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Convert a normalized float sample to i16
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Convert an i16 sample to a normalized float
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

/// Accumulates interleaved device input into fixed-size mono frames.
///
/// One frame buffer is reused for the whole stream, so feeding input never
/// allocates.
pub struct FrameAssembler {
    block_size: usize,
    frame: AudioFrame,
}

impl FrameAssembler {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            frame: AudioFrame::new(Vec::with_capacity(block_size)),
        }
    }

    /// Feed an interleaved buffer; `emit` is called once per completed frame.
    /// The frame is only valid for the duration of the call.
    ///
    /// Only the first channel of each interleaved group is kept.
    pub fn push_interleaved(&mut self, data: &[f32], channels: usize, mut emit: impl FnMut(&AudioFrame)) {
        let channels = channels.max(1);
        for group in data.chunks(channels) {
            self.frame.samples.push(f32_to_i16(group[0]));
            if self.frame.samples.len() == self.block_size {
                emit(&self.frame);
                self.frame.samples.clear();
            }
        }
    }

    /// Samples waiting for the next frame
    pub fn pending(&self) -> usize {
        self.frame.samples.len()
    }
}

/// Spreads fixed-size frames across arbitrary-length output buffers
#[derive(Default)]
pub struct PlaybackCursor {
    current: Option<AudioFrame>,
    position: usize,
}

impl PlaybackCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill an interleaved output buffer, pulling a new frame from `next`
    /// whenever the current one runs out. Mono samples are copied to every
    /// channel.
    pub fn fill(&mut self, out: &mut [f32], channels: usize, mut next: impl FnMut() -> AudioFrame) {
        let channels = channels.max(1);
        for group in out.chunks_mut(channels) {
            let exhausted = self
                .current
                .as_ref()
                .map_or(true, |frame| self.position >= frame.len());
            if exhausted {
                self.current = Some(next());
                self.position = 0;
            }

            let value = match &self.current {
                Some(frame) if self.position < frame.len() => {
                    let value = i16_to_f32(frame.samples[self.position]);
                    self.position += 1;
                    value
                }
                _ => 0.0,
            };
            group.fill(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_frame() {
        let frame = AudioFrame::silence(960);
        assert_eq!(frame.len(), 960);
        assert!(frame.samples.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_assembler_spans_buffers() {
        let mut assembler = FrameAssembler::new(4);
        let mut frames = Vec::new();

        assembler.push_interleaved(&[0.0, 0.5, 1.0], 1, |f| frames.push(f.clone()));
        assert!(frames.is_empty());
        assert_eq!(assembler.pending(), 3);

        assembler.push_interleaved(&[-1.0, 0.0, 0.0], 1, |f| frames.push(f.clone()));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples, vec![0, 16383, i16::MAX, -i16::MAX]);
        assert_eq!(assembler.pending(), 2);
    }

    #[test]
    fn test_assembler_keeps_first_channel() {
        let mut assembler = FrameAssembler::new(2);
        let mut frames = Vec::new();

        assembler.push_interleaved(&[1.0, -1.0, 0.0, -1.0], 2, |f| frames.push(f.clone()));
        assert_eq!(frames, vec![AudioFrame::new(vec![i16::MAX, 0])]);
    }

    #[test]
    fn test_assembler_reuses_frame_buffer() {
        let mut assembler = FrameAssembler::new(2);
        let mut seen = Vec::new();
        let mut buffers = Vec::new();

        assembler.push_interleaved(&[1.0, 0.0, 0.0, 1.0], 1, |f| {
            seen.push(f.samples.clone());
            buffers.push(f.samples.as_ptr());
        });

        assert_eq!(seen, vec![vec![i16::MAX, 0], vec![0, i16::MAX]]);
        assert_eq!(buffers[0], buffers[1]);
    }

    #[test]
    fn test_cursor_duplicates_to_channels() {
        let mut cursor = PlaybackCursor::new();
        let mut out = [9.0f32; 4];

        cursor.fill(&mut out, 2, || AudioFrame::new(vec![i16::MAX, 0]));
        assert_eq!(out, [1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_cursor_carries_partial_frame() {
        let mut cursor = PlaybackCursor::new();
        let mut pulls = 0;
        let mut next = || {
            pulls += 1;
            AudioFrame::new(vec![i16::MAX; 3])
        };

        let mut out = [0.0f32; 2];
        cursor.fill(&mut out, 1, &mut next);
        cursor.fill(&mut out, 1, &mut next);
        // 4 samples consumed from 3-sample frames: two pulls
        assert_eq!(pulls, 2);
    }

    #[test]
    fn test_cursor_handles_empty_frames() {
        let mut cursor = PlaybackCursor::new();
        let mut out = [5.0f32; 3];
        cursor.fill(&mut out, 1, || AudioFrame::new(Vec::new()));
        assert_eq!(out, [0.0, 0.0, 0.0]);
    }
}
