//! Client network link
//!
//! One non-blocking connection driven by a readiness loop on its own
//! thread. Each iteration waits (bounded by the poll timeout) for the
//! socket, then:
//!
//! - drains inbound bytes, reassembles frames and pushes the chunks onto
//!   the incoming queue;
//! - while the socket stays writable, frames and sends chunks from the
//!   outgoing queue.
//!
//! A zero-length read, a reset, a send failure or a socket error ends the
//! loop with [`RunState::Disconnected`]. The socket is *not* closed here:
//! the thread hands it back through [`NetworkLink::join`] and the owner
//! decides when to close it.

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::buffer::SharedQueue;
use crate::constants::PACKET_SIZE;
use crate::error::NetworkError;
use crate::protocol::{encode_frame, FrameDecoder};
use crate::state::{RunState, SharedRunState};

const LINK: Token = Token(0);

/// Link counters
#[derive(Debug, Default)]
pub struct LinkStats {
    chunks_sent: AtomicU64,
    chunks_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Point-in-time copy of [`LinkStats`]
#[derive(Debug, Clone, Default)]
pub struct LinkStatsSnapshot {
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl LinkStats {
    pub fn snapshot(&self) -> LinkStatsSnapshot {
        LinkStatsSnapshot {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running link thread
pub struct NetworkLink {
    state: SharedRunState,
    stats: Arc<LinkStats>,
    peer: SocketAddr,
    handle: Option<JoinHandle<TcpStream>>,
}

impl NetworkLink {
    /// Spawn the link loop for `stream`
    pub fn start(
        stream: TcpStream,
        outgoing: SharedQueue<Bytes>,
        incoming: SharedQueue<Bytes>,
        poll_timeout: Duration,
    ) -> Result<Self, NetworkError> {
        let poll = Poll::new().map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        let peer = stream
            .peer_addr()
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        let state = SharedRunState::new();
        let stats = Arc::new(LinkStats::default());
        state.set(RunState::Running);

        let link_loop = LinkLoop {
            poll,
            stream,
            outgoing,
            incoming,
            state: state.clone(),
            stats: stats.clone(),
            decoder: FrameDecoder::new(),
            pending: None,
            writable: false,
            poll_timeout,
        };

        let handle = thread::Builder::new()
            .name("network-link".to_string())
            .spawn(move || link_loop.run())
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Network link to {} started", peer);
        Ok(Self {
            state,
            stats,
            peer,
            handle: Some(handle),
        })
    }

    /// Ask the loop to exit; it notices within one poll timeout
    pub fn request_stop(&self) -> bool {
        self.state.request_stop()
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stats(&self) -> LinkStatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait for the loop to exit and take back the socket. The link is
    /// `Idle` afterwards. Returns `None` if already joined.
    pub fn join(&mut self) -> Option<TcpStream> {
        let handle = self.handle.take()?;
        let stream = match handle.join() {
            Ok(stream) => Some(stream),
            Err(_) => {
                tracing::error!("Network link thread panicked");
                None
            }
        };
        self.state.set(RunState::Idle);
        stream
    }
}

/// Why the loop gave up on the connection
enum Closed {
    Remote,
    Io(io::Error),
    Protocol(NetworkError),
}

struct LinkLoop {
    poll: Poll,
    stream: TcpStream,
    outgoing: SharedQueue<Bytes>,
    incoming: SharedQueue<Bytes>,
    state: SharedRunState,
    stats: Arc<LinkStats>,
    decoder: FrameDecoder,
    /// Unsent tail of a partially written frame
    pending: Option<Bytes>,
    /// Edge-triggered: true until a write hits `WouldBlock`
    writable: bool,
    poll_timeout: Duration,
}

impl LinkLoop {
    fn run(mut self) -> TcpStream {
        if let Err(e) = self.poll.registry().register(
            &mut self.stream,
            LINK,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.close(Closed::Io(e));
            return self.stream;
        }

        let mut events = Events::with_capacity(16);
        let mut buf = vec![0u8; PACKET_SIZE];

        while self.state.is_running() {
            match self.poll.poll(&mut events, Some(self.poll_timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.close(Closed::Io(e));
                    break;
                }
            }

            let mut readable = false;
            let mut failed = false;
            for event in events.iter() {
                readable |= event.is_readable() || event.is_read_closed();
                self.writable |= event.is_writable();
                failed |= event.is_error();
            }

            if failed {
                let error = self
                    .stream
                    .take_error()
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error"));
                self.close(Closed::Io(error));
                break;
            }

            if readable {
                if let Err(reason) = self.read_available(&mut buf) {
                    self.close(reason);
                    break;
                }
            }

            if self.writable {
                if let Err(reason) = self.flush() {
                    self.close(reason);
                    break;
                }
            }
        }

        let _ = self.poll.registry().deregister(&mut self.stream);
        tracing::debug!("Network link loop exited in state {:?}", self.state.get());
        self.stream
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<(), Closed> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Err(Closed::Remote),
                Ok(n) => {
                    self.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    self.decoder.extend(&buf[..n]);
                    while let Some(chunk) = self.decoder.next_frame().map_err(Closed::Protocol)? {
                        if chunk.is_empty() {
                            continue;
                        }
                        self.incoming.push(chunk);
                        self.stats.chunks_received.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Closed::Io(e)),
            }
        }
    }

    fn flush(&mut self) -> Result<(), Closed> {
        loop {
            let frame = match self.pending.take() {
                Some(frame) => frame,
                None => match self.outgoing.try_pop() {
                    Some(chunk) => match encode_frame(&chunk) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!("Dropping unsendable chunk: {}", e);
                            continue;
                        }
                    },
                    None => return Ok(()),
                },
            };

            match self.stream.write(&frame) {
                Ok(0) => return Err(Closed::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => {
                    self.stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    if n < frame.len() {
                        self.pending = Some(frame.slice(n..));
                    } else {
                        self.stats.chunks_sent.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.pending = Some(frame);
                    self.writable = false;
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.pending = Some(frame);
                }
                Err(e) => return Err(Closed::Io(e)),
            }
        }
    }

    /// Record the disconnect unless a stop request got there first
    fn close(&self, reason: Closed) {
        match reason {
            Closed::Remote => tracing::info!("Relay closed the connection"),
            Closed::Io(e) => tracing::warn!("Connection lost: {}", e),
            Closed::Protocol(e) => tracing::warn!("Protocol error from relay: {}", e),
        }
        self.state.transition(RunState::Running, RunState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{create_shared_queue, DropPolicy};
    use crate::network::socket;
    use std::net::TcpListener;
    use std::time::Instant;

    struct Harness {
        link: NetworkLink,
        server: std::net::TcpStream,
        outgoing: SharedQueue<Bytes>,
        incoming: SharedQueue<Bytes>,
    }

    fn harness() -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = socket::connect(listener.local_addr().unwrap(), Duration::from_secs(1)).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let outgoing = create_shared_queue(16, DropPolicy::DropOldest);
        let incoming = create_shared_queue(16, DropPolicy::DropOldest);
        let link = NetworkLink::start(
            stream,
            outgoing.clone(),
            incoming.clone(),
            Duration::from_millis(5),
        )
        .unwrap();

        Harness {
            link,
            server,
            outgoing,
            incoming,
        }
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
    fn test_outgoing_chunks_are_framed() {
        let mut h = harness();
        h.outgoing.push(Bytes::from_static(b"X0123"));

        let mut wire = [0u8; 7];
        std::io::Read::read_exact(&mut h.server, &mut wire).unwrap();
        assert_eq!(&wire[..], &encode_frame(b"X0123").unwrap()[..]);

        assert!(wait_for(|| h.link.stats().chunks_sent == 1));
        h.link.request_stop();
        h.link.join();
    }

    #[test]
    fn test_inbound_frames_reach_incoming_queue() {
        let mut h = harness();
        let mut wire = encode_frame(b"first").unwrap().to_vec();
        wire.extend_from_slice(&encode_frame(b"second").unwrap());
        std::io::Write::write_all(&mut h.server, &wire).unwrap();

        assert!(wait_for(|| h.incoming.len() == 2));
        assert_eq!(h.incoming.try_pop().unwrap(), Bytes::from_static(b"first"));
        assert_eq!(h.incoming.try_pop().unwrap(), Bytes::from_static(b"second"));

        h.link.request_stop();
        h.link.join();
    }

    #[test]
    fn test_remote_close_disconnects() {
        let mut h = harness();
        drop(h.server);

        assert!(wait_for(|| h.link.state() == RunState::Disconnected));
        assert!(!h.link.request_stop());
        assert!(h.link.join().is_some());
        assert_eq!(h.link.state(), RunState::Idle);
    }

    #[test]
    fn test_stop_returns_socket_open() {
        let mut h = harness();
        let start = Instant::now();
        assert!(h.link.request_stop());

        let stream = h.link.join().expect("socket handed back");
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(h.link.join().is_none());

        // Still usable: the link did not close it
        let mut stream = stream;
        std::io::Write::write_all(&mut stream, &encode_frame(b"late").unwrap()).unwrap();
        let mut wire = [0u8; 6];
        std::io::Read::read_exact(&mut h.server, &mut wire).unwrap();
        assert_eq!(&wire[2..], b"late");
    }

    #[test]
    fn test_stalled_relay_gets_intact_ordered_frames() {
        const CHUNKS: u32 = 2000;
        const LEN: usize = 4000;
        let mut h = harness();

        // Nothing is read on the relay side while the queue floods
        for seq in 0..CHUNKS {
            let mut chunk = vec![seq as u8; LEN];
            chunk[..4].copy_from_slice(&seq.to_be_bytes());
            h.outgoing.push(Bytes::from(chunk));
        }

        h.server.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut received = Vec::new();
        loop {
            let mut header = [0u8; 2];
            match h.server.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    break
                }
                Err(e) => panic!("read failed: {}", e),
            }
            assert_eq!(u16::from_be_bytes(header) as usize, LEN);

            let mut chunk = vec![0u8; LEN];
            h.server.read_exact(&mut chunk).unwrap();
            let seq = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            assert!(chunk[4..].iter().all(|&b| b == seq as u8), "chunk {} corrupted", seq);
            received.push(seq);
        }

        assert!(received.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(received.last(), Some(&(CHUNKS - 1)));
        assert_eq!(received.len() + h.outgoing.dropped_count(), CHUNKS as usize);
        assert!(wait_for(|| h.link.stats().chunks_sent == received.len() as u64));

        h.link.request_stop();
        h.link.join();
    }

    #[test]
    fn test_oversized_header_disconnects() {
        let mut h = harness();
        std::io::Write::write_all(&mut h.server, &[0xff, 0xff]).unwrap();
        assert!(wait_for(|| h.link.state() == RunState::Disconnected));
        h.link.join();
    }
}
