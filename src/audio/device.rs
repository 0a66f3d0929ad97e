//! Audio device enumeration and the device-side driver of the bridge
//!
//! The real-time device is a collaborator: it calls
//! [`AudioPath::on_capture`] and [`AudioPath::on_playback_request`] from its
//! own callback thread at its own cadence. [`CpalDevice`] is the production
//! implementation; [`NullDevice`] runs the bridge without any audio hardware.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig, SupportedStreamConfigRange};
use crossbeam_channel::bounded;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::bridge::AudioPath;
use crate::audio::frame::{FrameAssembler, PlaybackCursor};
use crate::config::AudioConfig;
use crate::error::AudioError;

/// Description of an audio endpoint
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    /// `input:<name>` or `output:<name>`
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Something that drives an [`AudioPath`] from a real-time callback
pub trait AudioDevice: Send {
    /// Begin device I/O, feeding captured frames to `path` and pulling
    /// playback frames from it.
    fn start(&mut self, path: Arc<AudioPath>) -> Result<(), AudioError>;

    /// Halt device I/O. Must be safe to call when not started.
    fn stop(&mut self);
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = get_device_capabilities(&device, true);
                devices.push(AudioDeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = get_device_capabilities(&device, false);
                devices.push(AudioDeviceInfo {
                    id: format!("output:{}", name),
                    is_default: default_output_name.as_ref() == Some(&name),
                    name,
                    is_input: false,
                    is_output: true,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

/// Rates worth reporting for voice
const VOICE_SAMPLE_RATES: [u32; 5] = [8000, 16000, 24000, 44100, 48000];

fn get_device_capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device.supported_input_configs().map(|c| c.collect()).unwrap_or_default()
    } else {
        device.supported_output_configs().map(|c| c.collect()).unwrap_or_default()
    };

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();
    for config in configs {
        for rate_val in VOICE_SAMPLE_RATES {
            let rate = cpal::SampleRate(rate_val);
            if rate >= config.min_sample_rate()
                && rate <= config.max_sample_rate()
                && !sample_rates.contains(&rate_val)
            {
                sample_rates.push(rate_val);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }

    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}

/// Resolve a device id from [`list_devices`], or the host default when `None`
fn resolve_device(id: Option<&str>, is_input: bool) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(id) = id else {
        let device = if is_input {
            host.default_input_device()
        } else {
            host.default_output_device()
        };
        return device.ok_or_else(|| {
            AudioError::DeviceNotFound(format!(
                "No default {} device",
                if is_input { "input" } else { "output" }
            ))
        });
    };

    let prefix = if is_input { "input:" } else { "output:" };
    let name = id.strip_prefix(prefix).unwrap_or(id);

    let devices = if is_input {
        host.input_devices()
    } else {
        host.output_devices()
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().ok().as_deref() == Some(name) {
            return Ok(device);
        }
    }

    Err(AudioError::DeviceNotFound(id.to_string()))
}

/// Channel count of a config offering f32 samples at `rate`, preferring
/// `preferred` when several match
fn f32_channels(ranges: &[SupportedStreamConfigRange], rate: u32, preferred: u16) -> Option<u16> {
    let rate = cpal::SampleRate(rate);
    let candidates: Vec<u16> = ranges
        .iter()
        .filter(|r| {
            r.sample_format() == SampleFormat::F32
                && r.min_sample_rate() <= rate
                && rate <= r.max_sample_rate()
        })
        .map(|r| r.channels())
        .collect();

    if candidates.contains(&preferred) {
        Some(preferred)
    } else {
        candidates.first().copied()
    }
}

/// Channels to open `device` with; fails when it cannot stream f32 at `rate`
fn stream_channels(device: &cpal::Device, is_input: bool, rate: u32) -> Result<u16, AudioError> {
    let name = device.name().unwrap_or_else(|_| "unknown device".into());
    let (ranges, default) = if is_input {
        let ranges: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| AudioError::DeviceNotFound(format!("{}: {}", name, e)))?
            .collect();
        (ranges, device.default_input_config().ok())
    } else {
        let ranges: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| AudioError::DeviceNotFound(format!("{}: {}", name, e)))?
            .collect();
        (ranges, device.default_output_config().ok())
    };

    let preferred = default.map(|c| c.channels()).unwrap_or(1);
    f32_channels(&ranges, rate, preferred).ok_or_else(|| {
        AudioError::UnsupportedFormat(format!("{} offers no f32 stream at {} Hz", name, rate))
    })
}

/// Full-duplex cpal device: one input and one output stream at the
/// configured sample rate
pub struct CpalDevice {
    config: AudioConfig,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalDevice {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Build and play both streams; they stop when dropped
fn open_streams(
    config: &AudioConfig,
    path: Arc<AudioPath>,
) -> Result<(cpal::Stream, cpal::Stream), AudioError> {
    let input = resolve_device(config.input_device.as_deref(), true)?;
    let output = resolve_device(config.output_device.as_deref(), false)?;

    let input_channels = stream_channels(&input, true, config.sample_rate)?;
    let output_channels = stream_channels(&output, false, config.sample_rate)?;

    let input_config = StreamConfig {
        channels: input_channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let output_config = StreamConfig {
        channels: output_channels,
        ..input_config.clone()
    };

    let capture_path = path.clone();
    let mut assembler = FrameAssembler::new(config.block_size);
    let input_stream = input
        .build_input_stream(
            &input_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                assembler.push_interleaved(data, input_channels as usize, |frame| {
                    if let Err(e) = capture_path.on_capture(frame) {
                        capture_path.report_error(e);
                    }
                });
            },
            |err| tracing::warn!("Input stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    let mut cursor = PlaybackCursor::new();
    let output_stream = output
        .build_output_stream(
            &output_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                cursor.fill(data, output_channels as usize, || path.on_playback_request());
            },
            |err| tracing::warn!("Output stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    input_stream
        .play()
        .map_err(|e| AudioError::StreamError(e.to_string()))?;
    output_stream
        .play()
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    Ok((input_stream, output_stream))
}

impl AudioDevice for CpalDevice {
    fn start(&mut self, path: Arc<AudioPath>) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let running = self.running.clone();
        let config = self.config.clone();

        running.store(true, Ordering::SeqCst);

        // cpal streams are not Send; they live and die on this thread
        let handle = thread::Builder::new()
            .name("audio-io".to_string())
            .spawn(move || {
                let streams = match open_streams(&config, path) {
                    Ok(streams) => streams,
                    Err(e) => {
                        running.store(false, Ordering::SeqCst);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                tracing::info!(
                    "Audio device I/O started ({} Hz, {} samples/frame, {} ms)",
                    config.sample_rate,
                    config.block_size,
                    config.block_duration().as_millis()
                );

                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }

                drop(streams);
                tracing::info!("Audio device I/O stopped");
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stop();
                Err(e)
            }
            Err(_) => {
                self.stop();
                Err(AudioError::StreamError("audio thread exited during startup".into()))
            }
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Device without audio hardware. Nothing is captured and nothing asks
/// for playback on its own; frames can be driven by hand through
/// [`AudioBridge::on_capture`](crate::audio::bridge::AudioBridge::on_capture)
/// and `on_playback_request`.
#[derive(Debug, Default)]
pub struct NullDevice;

impl NullDevice {
    pub fn new() -> Self {
        Self
    }
}

impl AudioDevice for NullDevice {
    fn start(&mut self, _path: Arc<AudioPath>) -> Result<(), AudioError> {
        Ok(())
    }

    fn stop(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices_ids_are_prefixed() {
        // May be empty on CI/systems without audio devices
        for device in list_devices() {
            assert!(device.id.starts_with("input:") || device.id.starts_with("output:"));
            assert_eq!(device.is_input, device.id.starts_with("input:"));
        }
    }

    fn range(channels: u16, min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            channels,
            cpal::SampleRate(min),
            cpal::SampleRate(max),
            cpal::SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_f32_channels_requires_float_at_rate() {
        let i16_only = [range(2, 8000, 48000, SampleFormat::I16)];
        assert_eq!(f32_channels(&i16_only, 48000, 2), None);

        let low_rate = [range(2, 8000, 16000, SampleFormat::F32)];
        assert_eq!(f32_channels(&low_rate, 48000, 2), None);
    }

    #[test]
    fn test_f32_channels_prefers_default_layout() {
        let ranges = [
            range(1, 8000, 48000, SampleFormat::F32),
            range(2, 8000, 48000, SampleFormat::F32),
            range(6, 8000, 48000, SampleFormat::I16),
        ];
        assert_eq!(f32_channels(&ranges, 48000, 2), Some(2));
        assert_eq!(f32_channels(&ranges, 48000, 6), Some(1));
    }

    #[test]
    fn test_unknown_device_id() {
        let result = resolve_device(Some("input:definitely-not-a-device-name"), true);
        assert!(matches!(result, Err(AudioError::DeviceNotFound(_))));
    }
}
