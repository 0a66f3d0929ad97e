//! # LAN Voice Relay
//!
//! Low-latency voice chat over a LAN: clients stream microphone audio to a
//! relay, which forwards every chunk to all other connected clients.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── CLIENT ────────────────────────────┐
//! │                                                                │
//! │  ┌────────────┐ on_capture  ┌─────────┐    ┌────────────────┐  │
//! │  │ Microphone │────────────▶│ Encoder │───▶│ outgoing queue │──┼──┐
//! │  └────────────┘             └─────────┘    └────────────────┘  │  │
//! │   device callback thread                                       │  │
//! │  ┌────────────┐ on_playback ┌────────────────┐  ┌─────────┐    │  │
//! │  │  Speaker   │◀────────────│ playback queue │◀─│ Decoder │◀─┐ │  │
//! │  └────────────┘             └────────────────┘  └─────────┘  │ │  │
//! │                              decode worker thread            │ │  │
//! │                                          ┌────────────────┐  │ │  │
//! │                                          │ incoming queue │──┘ │  │
//! │                                          └────────────────┘    │  │
//! │                                                  ▲             │  │
//! │  ┌───────────────────────────────────────────────┴──────────┐  │  │
//! │  │ NetworkLink (network::link) - one mio loop, one socket   │◀─┼──┘
//! │  └───────────────────────────────────────────────┬──────────┘  │
//! └──────────────────────────────────────────────────┼─────────────┘
//!                                                    │ TCP, [len u16][chunk]
//!                                                    ▼
//! ┌───────────────────────────── RELAY ────────────────────────────┐
//! │  RelayServer (network::relay) - one mio loop, all sockets      │
//! │     read A ─▶ reassemble ─▶ push to B, C outbound queues       │
//! │     write B, C while their queues are non-empty                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threads
//!
//! - The audio device callback only performs non-blocking queue work.
//! - The client link and the relay each run a single readiness loop; the
//!   relay never spawns a thread per connection.

pub mod audio;
pub mod buffer;
#[cfg(feature = "client")]
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod state;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default frame size in samples (20 ms at 48 kHz)
    pub const DEFAULT_BLOCK_SIZE: usize = 960;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 32_000;

    /// Default relay port
    pub const DEFAULT_PORT: u16 = 1234;

    /// Default listen backlog of the relay
    pub const DEFAULT_MAX_CLIENTS: u32 = 4;

    /// Largest chunk payload allowed in one frame
    pub const MAX_CHUNK_SIZE: usize = 4096;

    /// Bytes read from a socket per receive call
    pub const PACKET_SIZE: usize = 4096;
}
