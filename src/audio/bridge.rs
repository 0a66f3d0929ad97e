//! Audio bridge between the real-time device callback and the network
//!
//! ```text
//!  device callback ──on_capture──▶ encoder ──▶ outgoing queue ──▶ NetworkLink
//!  device callback ◀─on_playback── playback queue ◀── decode worker ◀── incoming queue ◀── NetworkLink
//! ```
//!
//! The callback side ([`AudioPath`]) only performs non-blocking queue
//! operations. Decoding happens on a dedicated worker thread that waits on
//! the incoming queue with a bounded timeout so it notices shutdown.

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::AudioDevice;
use crate::audio::frame::AudioFrame;
use crate::buffer::{create_shared_queue, ChunkQueue, SharedQueue};
use crate::codec::{Decoder, Encoder};
use crate::config::{AudioConfig, ClientConfig};
use crate::error::{AudioError, CodecError};
use crate::state::{RunState, SharedRunState};

/// Codec errors kept for `check_errors` before newer ones are dropped
const ERROR_CHANNEL_CAPACITY: usize = 16;

/// Callback-facing half of the bridge, shared with the audio device
pub struct AudioPath {
    block_size: usize,
    outgoing: SharedQueue<Bytes>,
    incoming: SharedQueue<Bytes>,
    playback: ChunkQueue<AudioFrame>,
    encoder: Mutex<Box<dyn Encoder>>,
    muted: AtomicBool,
    error_tx: Sender<CodecError>,
    frames_captured: AtomicU64,
    frames_skipped: AtomicU64,
    chunks_encoded: AtomicU64,
    frames_decoded: AtomicU64,
}

impl AudioPath {
    /// Hand one captured frame to the encoder.
    ///
    /// Muted frames are discarded. Never blocks: if the encoder is busy
    /// with a mute toggle the frame is skipped.
    pub fn on_capture(&self, frame: &AudioFrame) -> Result<(), CodecError> {
        if self.muted.load(Ordering::Acquire) {
            return Ok(());
        }

        let Some(mut encoder) = self.encoder.try_lock() else {
            self.frames_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        // Re-check under the lock; a toggle may have landed in between
        if self.muted.load(Ordering::Acquire) {
            return Ok(());
        }

        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        let outgoing = &self.outgoing;
        let chunks_encoded = &self.chunks_encoded;
        encoder.encode(frame, &mut |chunk| {
            outgoing.push(chunk);
            chunks_encoded.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Next frame to play, or one silent frame when nothing is ready
    pub fn on_playback_request(&self) -> AudioFrame {
        match self.playback.pop_or_underrun() {
            Some(frame) => frame,
            None => AudioFrame::silence(self.block_size),
        }
    }

    /// Surface a codec error raised outside a call that can return it
    pub fn report_error(&self, error: CodecError) {
        tracing::warn!("Codec error: {}", error);
        let _ = self.error_tx.try_send(error);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Flip mute; returns the new state. Muting discards chunks that were
    /// encoded but not yet sent.
    fn toggle_mute(&self) -> bool {
        let _encoder = self.encoder.lock();
        let muted = !self.muted.load(Ordering::Acquire);
        self.muted.store(muted, Ordering::Release);
        if muted {
            let discarded = self.outgoing.clear();
            tracing::debug!("Muted, discarded {} unsent chunks", discarded);
        }
        muted
    }

    fn clear_queues(&self) {
        self.outgoing.clear();
        self.incoming.clear();
        self.playback.clear();
    }
}

/// Bridge statistics
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    pub frames_captured: u64,
    pub frames_skipped: u64,
    pub chunks_encoded: u64,
    pub frames_decoded: u64,
    pub silence_frames: u64,
    pub outgoing_depth: usize,
    pub incoming_depth: usize,
    pub playback_depth: usize,
    pub outgoing_dropped: usize,
    pub incoming_dropped: usize,
    pub playback_dropped: usize,
}

/// Owns the audio device, the codec pair and the client-side queues
pub struct AudioBridge {
    path: Arc<AudioPath>,
    device: Box<dyn AudioDevice>,
    decoder: Option<Box<dyn Decoder>>,
    worker: Option<JoinHandle<Box<dyn Decoder>>>,
    state: SharedRunState,
    error_rx: Receiver<CodecError>,
    decode_timeout: Duration,
}

impl AudioBridge {
    pub fn new(
        audio: &AudioConfig,
        client: &ClientConfig,
        device: Box<dyn AudioDevice>,
        encoder: Box<dyn Encoder>,
        decoder: Box<dyn Decoder>,
    ) -> Self {
        let (error_tx, error_rx) = bounded(ERROR_CHANNEL_CAPACITY);
        let policy = client.drop_policy;

        let path = Arc::new(AudioPath {
            block_size: audio.block_size,
            outgoing: create_shared_queue(client.outgoing_capacity, policy),
            incoming: create_shared_queue(client.incoming_capacity, policy),
            playback: ChunkQueue::new(client.playback_capacity, policy),
            encoder: Mutex::new(encoder),
            muted: AtomicBool::new(false),
            error_tx,
            frames_captured: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            chunks_encoded: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
        });

        Self {
            path,
            device,
            decoder: Some(decoder),
            worker: None,
            state: SharedRunState::new(),
            error_rx,
            decode_timeout: client.decode_timeout(),
        }
    }

    /// Encoded chunks waiting to be sent
    pub fn outgoing(&self) -> SharedQueue<Bytes> {
        self.path.outgoing.clone()
    }

    /// Received chunks waiting to be decoded
    pub fn incoming(&self) -> SharedQueue<Bytes> {
        self.path.incoming.clone()
    }

    pub fn on_capture(&self, frame: &AudioFrame) -> Result<(), CodecError> {
        self.path.on_capture(frame)
    }

    pub fn on_playback_request(&self) -> AudioFrame {
        self.path.on_playback_request()
    }

    /// Discard stale session data, start the decode worker and device I/O
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.state.is_running() {
            tracing::warn!("Audio bridge already running");
            return Ok(());
        }

        let decoder = self
            .decoder
            .take()
            .ok_or_else(|| AudioError::StreamError("decoder lost by a previous run".into()))?;

        self.path.clear_queues();
        self.state.set(RunState::Running);

        let path = self.path.clone();
        let state = self.state.clone();
        let timeout = self.decode_timeout;
        let worker = thread::Builder::new()
            .name("audio-decode".to_string())
            .spawn(move || decode_loop(decoder, path, state, timeout))
            .map_err(|e| {
                self.state.set(RunState::Stopped);
                AudioError::StreamError(e.to_string())
            })?;
        self.worker = Some(worker);

        if let Err(e) = self.device.start(self.path.clone()) {
            tracing::error!("Failed to start audio device: {}", e);
            self.stop();
            return Err(e);
        }

        tracing::info!("Audio bridge started");
        Ok(())
    }

    /// Discard queued audio from a previous session. Device I/O and the
    /// decode worker keep running.
    pub fn reset_session(&self) {
        self.path.clear_queues();
    }

    /// Halt device I/O and the decode worker. Safe to call at any time.
    pub fn stop(&mut self) {
        if !self.state.request_stop() {
            return;
        }

        self.device.stop();
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(decoder) => self.decoder = Some(decoder),
                Err(_) => tracing::error!("Decode worker panicked"),
            }
        }

        self.state.set(RunState::Stopped);
        tracing::info!("Audio bridge stopped");
    }

    /// Flip mute; returns `true` if now muted
    pub fn toggle_mute(&self) -> bool {
        self.path.toggle_mute()
    }

    pub fn is_muted(&self) -> bool {
        self.path.is_muted()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    /// Oldest unreported codec error, if any
    pub fn check_errors(&self) -> Option<CodecError> {
        self.error_rx.try_recv().ok()
    }

    pub fn stats(&self) -> BridgeStats {
        let path = &self.path;
        BridgeStats {
            frames_captured: path.frames_captured.load(Ordering::Relaxed),
            frames_skipped: path.frames_skipped.load(Ordering::Relaxed),
            chunks_encoded: path.chunks_encoded.load(Ordering::Relaxed),
            frames_decoded: path.frames_decoded.load(Ordering::Relaxed),
            silence_frames: path.playback.underrun_count() as u64,
            outgoing_depth: path.outgoing.len(),
            incoming_depth: path.incoming.len(),
            playback_depth: path.playback.len(),
            outgoing_dropped: path.outgoing.dropped_count(),
            incoming_dropped: path.incoming.dropped_count(),
            playback_dropped: path.playback.dropped_count(),
        }
    }
}

impl Drop for AudioBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_loop(
    mut decoder: Box<dyn Decoder>,
    path: Arc<AudioPath>,
    state: SharedRunState,
    timeout: Duration,
) -> Box<dyn Decoder> {
    while state.is_running() {
        let Some(chunk) = path.incoming.pop_timeout(timeout) else {
            continue;
        };

        let playback = &path.playback;
        let frames_decoded = &path.frames_decoded;
        let result = decoder.decode(&chunk, &mut |frame| {
            playback.push(frame);
            frames_decoded.fetch_add(1, Ordering::Relaxed);
        });
        if let Err(e) = result {
            path.report_error(e);
        }
    }
    decoder
}
