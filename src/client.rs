//! Client session orchestration
//!
//! [`ConnectionSupervisor`] owns the socket, the [`NetworkLink`] thread and
//! the [`AudioBridge`], and sequences them:
//!
//! ```text
//!   connect ──▶ connected ──start_talking──▶ talking (bridge + link)
//!      ▲            │                            │
//!      └────────────┴──────── disconnect ◀───────┘
//! ```
//!
//! Audio and transport have independent lifecycles: `stop_talking` leaves
//! the link up, and `disconnect` leaves the audio bridge running.

use mio::net::TcpStream;
use std::net::Shutdown;

use crate::audio::bridge::{AudioBridge, BridgeStats};
use crate::audio::device::{list_devices, AudioDevice, AudioDeviceInfo, CpalDevice};
use crate::codec::{create_codec, Decoder, Encoder};
use crate::config::AppConfig;
use crate::error::Result;
use crate::network::link::{LinkStatsSnapshot, NetworkLink};
use crate::network::socket;

/// Session status for display
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub connected: bool,
    pub talking: bool,
    pub muted: bool,
    pub bridge: BridgeStats,
    pub link: Option<LinkStatsSnapshot>,
}

pub struct ConnectionSupervisor {
    config: AppConfig,
    bridge: AudioBridge,
    /// Connected socket not yet handed to a link
    stream: Option<TcpStream>,
    link: Option<NetworkLink>,
}

impl ConnectionSupervisor {
    pub fn new(
        config: AppConfig,
        device: Box<dyn AudioDevice>,
        encoder: Box<dyn Encoder>,
        decoder: Box<dyn Decoder>,
    ) -> Self {
        let bridge = AudioBridge::new(&config.audio, &config.client, device, encoder, decoder);
        Self {
            config,
            bridge,
            stream: None,
            link: None,
        }
    }

    /// Supervisor backed by the system audio device and the configured codec
    pub fn with_defaults(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let (encoder, decoder) = create_codec(&config.audio)?;
        let device = Box::new(CpalDevice::new(config.audio.clone()));
        Ok(Self::new(config, device, encoder, decoder))
    }

    /// Open a fresh connection to the relay. Any previous session is torn
    /// down first. Failures are logged and reported as `false`.
    pub fn connect(&mut self, host: &str, port: u16) -> bool {
        self.disconnect();

        let addr = match socket::resolve(host, port) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("Cannot connect: {}", e);
                return false;
            }
        };

        match socket::connect(addr, self.config.client.connect_timeout()) {
            Ok(stream) => {
                tracing::info!("Connected to {}", addr);
                self.stream = Some(stream);
                true
            }
            Err(e) => {
                tracing::warn!("Connection failed: {}", e);
                false
            }
        }
    }

    /// Start audio and, if not already running, the network link.
    /// Returns `false` (and does nothing) when not connected.
    pub fn start_talking(&mut self) -> bool {
        if !self.is_connected() {
            tracing::warn!("Not connected, cannot start talking");
            return false;
        }

        if let Err(e) = self.bridge.start() {
            tracing::error!("Failed to start audio: {}", e);
            return false;
        }

        if let Some(stream) = self.stream.take() {
            // Audio may have kept running across a disconnect
            self.bridge.reset_session();
            match NetworkLink::start(
                stream,
                self.bridge.outgoing(),
                self.bridge.incoming(),
                self.config.client.poll_timeout(),
            ) {
                Ok(link) => self.link = Some(link),
                Err(e) => {
                    tracing::error!("Failed to start network link: {}", e);
                    self.bridge.stop();
                    return false;
                }
            }
        }

        tracing::info!("Talking");
        true
    }

    /// Stop audio; the link stays up. Safe to call repeatedly.
    pub fn stop_talking(&mut self) {
        self.bridge.stop();
    }

    /// Stop the link and close the socket. Safe to call repeatedly; the
    /// socket is closed exactly once.
    pub fn disconnect(&mut self) {
        let stream = match self.link.take() {
            Some(mut link) => {
                link.request_stop();
                link.join()
            }
            None => self.stream.take(),
        };

        if let Some(stream) = stream {
            let peer = stream.peer_addr().ok();
            let _ = stream.shutdown(Shutdown::Both);
            drop(stream);
            match peer {
                Some(peer) => tracing::info!("Disconnected from {}", peer),
                None => tracing::info!("Disconnected"),
            }
        }
    }

    /// Flip mute; returns `true` if now muted
    pub fn toggle_mute(&self) -> bool {
        self.bridge.toggle_mute()
    }

    /// Connected and the link, if started, has not lost the peer
    pub fn is_connected(&self) -> bool {
        match &self.link {
            Some(link) => link.is_running(),
            None => self.stream.is_some(),
        }
    }

    pub fn is_talking(&self) -> bool {
        self.bridge.is_running()
    }

    pub fn is_muted(&self) -> bool {
        self.bridge.is_muted()
    }

    pub fn bridge(&self) -> &AudioBridge {
        &self.bridge
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn list_audio_devices(&self) -> Vec<AudioDeviceInfo> {
        list_devices()
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            connected: self.is_connected(),
            talking: self.is_talking(),
            muted: self.is_muted(),
            bridge: self.bridge.stats(),
            link: self.link.as_ref().map(NetworkLink::stats),
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.disconnect();
        self.bridge.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::NullDevice;
    use crate::audio::frame::AudioFrame;
    use crate::codec::{CodecKind, PcmDecoder, PcmEncoder};
    use crate::config::{AudioConfig, ClientConfig};
    use crate::protocol::encode_frame;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream as StdTcpStream};
    use std::thread;
    use std::time::{Duration, Instant};

    const BLOCK: usize = 4;

    fn supervisor() -> ConnectionSupervisor {
        let config = AppConfig {
            audio: AudioConfig {
                block_size: BLOCK,
                codec: CodecKind::Pcm,
                ..Default::default()
            },
            client: ClientConfig {
                poll_timeout_ms: 5,
                decode_timeout_ms: 5,
                ..Default::default()
            },
            ..Default::default()
        };
        ConnectionSupervisor::new(
            config,
            Box::new(NullDevice::new()),
            Box::new(PcmEncoder::new(BLOCK)),
            Box::new(PcmDecoder::new()),
        )
    }

    fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn accept(listener: &TcpListener) -> StdTcpStream {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        stream
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_start_talking_requires_connection() {
        let mut client = supervisor();
        assert!(!client.start_talking());
        assert!(!client.is_talking());
    }

    #[test]
    fn test_refused_connection_returns_false() {
        let (listener, port) = listener();
        drop(listener);

        let mut client = supervisor();
        assert!(!client.connect("127.0.0.1", port));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_disconnect_twice() {
        let (listener, port) = listener();
        let mut client = supervisor();
        assert!(client.connect("127.0.0.1", port));
        let _server = accept(&listener);

        client.disconnect();
        assert!(!client.is_connected());
        client.disconnect();
        assert!(!client.is_connected());
    }

    #[test]
    fn test_reconnect_closes_previous_socket() {
        let (listener, port) = listener();
        let mut client = supervisor();

        assert!(client.connect("127.0.0.1", port));
        let mut first = accept(&listener);
        assert!(client.connect("127.0.0.1", port));
        let _second = accept(&listener);

        let mut buf = [0u8; 1];
        assert_eq!(first.read(&mut buf).unwrap(), 0);
        assert!(client.is_connected());
    }

    #[test]
    fn test_captured_audio_reaches_the_wire() {
        let (listener, port) = listener();
        let mut client = supervisor();
        assert!(client.connect("127.0.0.1", port));
        let mut server = accept(&listener);

        assert!(client.start_talking());
        client.bridge().on_capture(&AudioFrame::new(vec![7; BLOCK])).unwrap();

        let mut received = vec![0u8; 2 + BLOCK * 2];
        server.read_exact(&mut received).unwrap();
        let expected: Vec<u8> = std::iter::repeat(7i16.to_le_bytes())
            .take(BLOCK)
            .flatten()
            .collect();
        assert_eq!(received, encode_frame(&expected).unwrap().to_vec());
    }

    #[test]
    fn test_reconnect_drops_audio_from_previous_session() {
        let (listener, port) = listener();
        let mut client = supervisor();
        assert!(client.connect("127.0.0.1", port));
        let _old = accept(&listener);
        assert!(client.start_talking());

        client.disconnect();
        // Audio keeps running across the disconnect
        assert!(client.is_talking());
        client.bridge().on_capture(&AudioFrame::new(vec![9; BLOCK])).unwrap();

        assert!(client.connect("127.0.0.1", port));
        let mut server = accept(&listener);
        assert!(client.start_talking());

        server.set_read_timeout(Some(Duration::from_millis(150))).unwrap();
        let mut byte = [0u8; 1];
        match server.read(&mut byte) {
            Err(e) => assert!(matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )),
            Ok(n) => panic!("stale audio on the new session: {} bytes", n),
        }

        // Fresh audio still flows
        client.bridge().on_capture(&AudioFrame::new(vec![5; BLOCK])).unwrap();
        server.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut received = vec![0u8; 2 + BLOCK * 2];
        server.read_exact(&mut received).unwrap();
        assert_eq!(&received[2..4], &5i16.to_le_bytes());
    }

    #[test]
    fn test_received_audio_is_played() {
        let (listener, port) = listener();
        let mut client = supervisor();
        assert!(client.connect("127.0.0.1", port));
        let mut server = accept(&listener);
        assert!(client.start_talking());

        let payload: Vec<u8> = std::iter::repeat(3i16.to_le_bytes())
            .take(BLOCK)
            .flatten()
            .collect();
        server.write_all(&encode_frame(&payload).unwrap()).unwrap();

        let expected = AudioFrame::new(vec![3; BLOCK]);
        assert!(wait_for(|| client.bridge().on_playback_request() == expected));
    }

    #[test]
    fn test_stop_talking_keeps_link() {
        let (listener, port) = listener();
        let mut client = supervisor();
        assert!(client.connect("127.0.0.1", port));
        let _server = accept(&listener);

        assert!(client.start_talking());
        client.stop_talking();
        client.stop_talking();
        assert!(!client.is_talking());
        assert!(client.is_connected());

        // Talking again reuses the running link
        assert!(client.start_talking());
        assert!(client.is_talking());
    }

    #[test]
    fn test_remote_close_is_noticed() {
        let (listener, port) = listener();
        let mut client = supervisor();
        assert!(client.connect("127.0.0.1", port));
        let server = accept(&listener);
        assert!(client.start_talking());

        drop(server);
        assert!(wait_for(|| !client.is_connected()));
        assert!(!client.stats().connected);

        // Reconnect after the peer went away
        assert!(client.connect("127.0.0.1", port));
        let _server = accept(&listener);
        assert!(client.is_connected());
    }

    #[test]
    fn test_mute_toggles() {
        let client = supervisor();
        assert!(client.toggle_mute());
        assert!(client.is_muted());
        assert!(!client.toggle_mute());
    }
}
