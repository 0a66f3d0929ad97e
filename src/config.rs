//! Application configuration
//!
//! All sections default sensibly, so an empty (or missing) TOML file is a
//! valid configuration:
//!
//! ```toml
//! [audio]
//! sample_rate = 48000
//! block_size = 960
//! codec = "opus"
//!
//! [relay]
//! host = "0.0.0.0"
//! port = 1234
//! max_clients = 4
//! ```

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::buffer::DropPolicy;
use crate::codec::CodecKind;
use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub client: ClientConfig,
    pub relay: RelayConfig,
}

/// Audio format and codec settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Samples per frame (mono)
    pub block_size: usize,
    pub codec: CodecKind,
    /// Opus bitrate in bits per second
    pub bitrate: u32,
    /// Input device id as reported by `list_devices`; default device if unset
    pub input_device: Option<String>,
    /// Output device id as reported by `list_devices`; default device if unset
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            block_size: DEFAULT_BLOCK_SIZE,
            codec: CodecKind::Opus,
            bitrate: DEFAULT_BITRATE,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    /// Duration of one frame
    pub fn block_duration(&self) -> Duration {
        Duration::from_micros(self.block_size as u64 * 1_000_000 / self.sample_rate as u64)
    }
}

/// Client transport and queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    /// Upper bound on one readiness wait in the network link
    pub poll_timeout_ms: u64,
    /// Upper bound on one incoming-queue wait in the decode worker
    pub decode_timeout_ms: u64,
    pub outgoing_capacity: usize,
    pub incoming_capacity: usize,
    pub playback_capacity: usize,
    pub drop_policy: DropPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            poll_timeout_ms: 5,
            decode_timeout_ms: 50,
            outgoing_capacity: 64,
            incoming_capacity: 64,
            playback_capacity: 32,
            drop_policy: DropPolicy::DropOldest,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_millis(self.decode_timeout_ms)
    }
}

/// Relay server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Listen backlog
    pub max_clients: u32,
    /// Upper bound on one readiness wait; bounds shutdown latency
    pub poll_timeout_ms: u64,
    /// Per-connection outbound queue capacity, in chunks
    pub queue_capacity: usize,
    pub drop_policy: DropPolicy,
    /// Interval between stats log lines; 0 disables them
    pub stats_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            poll_timeout_ms: 50,
            queue_capacity: 128,
            drop_policy: DropPolicy::DropOldest,
            stats_interval_secs: 10,
        }
    }
}

impl RelayConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

impl AppConfig {
    /// Parse a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the per-user config directory, or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {}", path.display());
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/config.toml` for this application
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "lan-voice-relay").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 || self.audio.block_size == 0 {
            return Err(Error::Config("sample_rate and block_size must be non-zero".into()));
        }
        if !self.audio.codec.supports_block(self.audio.sample_rate, self.audio.block_size) {
            return Err(Error::Config(format!(
                "{:?} cannot frame {} samples at {} Hz",
                self.audio.codec, self.audio.block_size, self.audio.sample_rate
            )));
        }
        if self.audio.block_size * 2 > MAX_CHUNK_SIZE && self.audio.codec == CodecKind::Pcm {
            return Err(Error::Config(format!(
                "PCM frames of {} samples exceed the {} byte chunk limit",
                self.audio.block_size, MAX_CHUNK_SIZE
            )));
        }

        let capacities = [
            self.client.outgoing_capacity,
            self.client.incoming_capacity,
            self.client.playback_capacity,
            self.relay.queue_capacity,
        ];
        if capacities.contains(&0) {
            return Err(Error::Config("queue capacities must be non-zero".into()));
        }
        if self.relay.max_clients == 0 {
            return Err(Error::Config("max_clients must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.audio.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(config.relay.port, DEFAULT_PORT);
        assert_eq!(config.client.drop_policy, DropPolicy::DropOldest);
    }

    #[test]
    fn test_partial_override() {
        let config = AppConfig::from_toml(
            r#"
            [audio]
            codec = "pcm"
            block_size = 480

            [relay]
            port = 5005
            drop_policy = "drop_newest"
            "#,
        )
        .unwrap();

        assert_eq!(config.audio.codec, CodecKind::Pcm);
        assert_eq!(config.audio.block_size, 480);
        assert_eq!(config.relay.port, 5005);
        assert_eq!(config.relay.drop_policy, DropPolicy::DropNewest);
        assert_eq!(config.relay.max_clients, DEFAULT_MAX_CLIENTS);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let result = AppConfig::from_toml("[relay]\nqueue_capacity = 0\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_unframeable_opus_block() {
        let result = AppConfig::from_toml("[audio]\nblock_size = 1024\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_block_duration() {
        let audio = AudioConfig::default();
        assert_eq!(audio.block_duration(), Duration::from_millis(20));
    }
}
