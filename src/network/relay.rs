//! Relay server
//!
//! One thread, one `mio` readiness loop, every connection:
//!
//! ```text
//!               ┌────────────────────────── relay loop ──────────────────────────┐
//!  client A ──▶ │ read ─▶ FrameDecoder ─▶ broadcast ─┬─▶ B.outbound ─▶ write ─▶ │ ──▶ client B
//!               │                                    └─▶ C.outbound ─▶ write ─▶ │ ──▶ client C
//!               └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every connection is registered for read interest from accept to
//! removal, and for write interest only while its outbound queue (or a
//! partially written frame) is non-empty. The sender never receives its
//! own chunks back.
//!
//! Failures (zero-length read, reset, send error, protocol violation,
//! socket error) mark the connection as closing; all closing connections
//! are removed at the end of the loop iteration, exactly once each.

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::buffer::{ChunkQueue, DropPolicy};
use crate::config::RelayConfig;
use crate::constants::PACKET_SIZE;
use crate::error::NetworkError;
use crate::network::socket;
use crate::protocol::{encode_frame, FrameDecoder};
use crate::state::{RunState, SharedRunState};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_PEER: usize = 2;

/// Reads taken from one socket before other sockets get a turn. A socket
/// left with unread data is revisited on the next iteration.
const MAX_READS_PER_TURN: usize = 8;

/// Relay counters, updated by the loop and readable from any thread
#[derive(Debug, Default)]
pub struct RelayStats {
    accepted: AtomicU64,
    active: AtomicUsize,
    chunks_received: AtomicU64,
    chunks_relayed: AtomicU64,
    chunks_dropped: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    queued: AtomicUsize,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub connections_accepted: u64,
    pub active_connections: usize,
    pub chunks_received: u64,
    /// Copies offered to peer queues
    pub chunks_relayed: u64,
    /// Copies lost to full outbound queues
    pub chunks_dropped: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Total chunks waiting in all outbound queues
    pub queued_chunks: usize,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            connections_accepted: self.accepted.load(Ordering::Relaxed),
            active_connections: self.active.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_relayed: self.chunks_relayed.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            queued_chunks: self.queued.load(Ordering::Relaxed),
        }
    }
}

/// One accepted connection and its relay-side state
pub struct Peer<S> {
    pub stream: S,
    pub addr: SocketAddr,
    outbound: ChunkQueue<Bytes>,
    inbound: FrameDecoder,
    /// Unsent tail of a partially written frame
    pending: Option<Bytes>,
    write_registered: bool,
    closing: bool,
}

impl<S> Peer<S> {
    pub fn outbound(&self) -> &ChunkQueue<Bytes> {
        &self.outbound
    }
}

/// Connection table: one entry, and one outbound queue, per live connection
pub struct PeerTable<S> {
    peers: HashMap<Token, Peer<S>>,
    queue_capacity: usize,
    policy: DropPolicy,
}

impl<S> PeerTable<S> {
    pub fn new(queue_capacity: usize, policy: DropPolicy) -> Self {
        Self {
            peers: HashMap::new(),
            queue_capacity,
            policy,
        }
    }

    /// Add a connection with an empty outbound queue
    pub fn insert(&mut self, token: Token, stream: S, addr: SocketAddr) {
        self.peers.insert(
            token,
            Peer {
                stream,
                addr,
                outbound: ChunkQueue::new(self.queue_capacity, self.policy),
                inbound: FrameDecoder::new(),
                pending: None,
                write_registered: false,
                closing: false,
            },
        );
    }

    /// Take a connection out of the table. Returns `None` once it is gone,
    /// so a connection can only ever be torn down once.
    pub fn remove(&mut self, token: Token) -> Option<Peer<S>> {
        self.peers.remove(&token)
    }

    pub fn get(&self, token: Token) -> Option<&Peer<S>> {
        self.peers.get(&token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Peer<S>> {
        self.peers.get_mut(&token)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Mark a connection for removal at the end of the iteration
    pub fn mark_closing(&mut self, token: Token) {
        if let Some(peer) = self.peers.get_mut(&token) {
            peer.closing = true;
        }
    }

    pub fn closing_tokens(&self) -> Vec<Token> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.closing)
            .map(|(token, _)| *token)
            .collect()
    }

    /// Queue `frame` for every live connection except `from`.
    ///
    /// Returns the connections that now need write interest.
    pub fn broadcast(&mut self, from: Token, frame: &Bytes, stats: &RelayStats) -> Vec<Token> {
        let mut needs_write = Vec::new();
        for (token, peer) in self.peers.iter_mut() {
            if *token == from || peer.closing {
                continue;
            }
            stats.chunks_relayed.fetch_add(1, Ordering::Relaxed);
            if !peer.outbound.push(frame.clone()) {
                stats.chunks_dropped.fetch_add(1, Ordering::Relaxed);
            }
            if !peer.write_registered {
                peer.write_registered = true;
                needs_write.push(*token);
            }
        }
        needs_write
    }

    /// Chunks waiting across all outbound queues
    pub fn queued(&self) -> usize {
        self.peers.values().map(|peer| peer.outbound.len()).sum()
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.peers.keys().copied().collect()
    }
}

/// The relay: owns the loop thread and its lifecycle
pub struct RelayServer {
    config: RelayConfig,
    state: SharedRunState,
    stats: Arc<RelayStats>,
    local_addr: Option<SocketAddr>,
    waker: Option<Arc<Waker>>,
    handle: Option<JoinHandle<()>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            state: SharedRunState::new(),
            stats: Arc::new(RelayStats::default()),
            local_addr: None,
            waker: None,
            handle: None,
        }
    }

    /// Bind `host:port` and start relaying. Returns whether the relay is
    /// now running; failures are logged.
    pub fn start(&mut self, host: &str, port: u16) -> bool {
        if self.state.is_running() {
            tracing::warn!("Relay already running on {:?}", self.local_addr);
            return false;
        }
        // Reap a previous run that ended on its own
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        match self.spawn(host, port) {
            Ok(addr) => {
                tracing::info!("Relay started on {}", addr);
                true
            }
            Err(e) => {
                tracing::error!("Failed to start relay on {}:{}: {}", host, port, e);
                self.state.set(RunState::Stopped);
                false
            }
        }
    }

    fn spawn(&mut self, host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
        let addr = socket::resolve(host, port)?;
        let mut listener = socket::bind_listener(addr, self.config.max_clients)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let poll = Poll::new().map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER).map_err(|e| NetworkError::BindFailed(e.to_string()))?,
        );
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        self.stats = Arc::new(RelayStats::default());
        self.state.set(RunState::Running);

        let relay_loop = RelayLoop {
            poll,
            listener,
            peers: PeerTable::new(self.config.queue_capacity, self.config.drop_policy),
            next_token: FIRST_PEER,
            state: self.state.clone(),
            stats: self.stats.clone(),
            config: self.config.clone(),
            backlog: Vec::new(),
        };

        let handle = thread::Builder::new()
            .name("relay-loop".to_string())
            .spawn(move || relay_loop.run())
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        self.handle = Some(handle);
        self.waker = Some(waker);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Request shutdown and wait for the loop to close every socket,
    /// the listener included. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.state.request_stop() {
            if let Some(waker) = &self.waker {
                let _ = waker.wake();
            }
        }

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Relay loop panicked");
                self.state.set(RunState::Stopped);
            }
        }
        self.waker = None;
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn state(&self) -> RunState {
        self.state.get()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct RelayLoop {
    poll: Poll,
    listener: TcpListener,
    peers: PeerTable<TcpStream>,
    next_token: usize,
    state: SharedRunState,
    stats: Arc<RelayStats>,
    config: RelayConfig,
    /// Connections that hit the read cap and still have data buffered
    backlog: Vec<Token>,
}

impl RelayLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(256);
        let mut buf = vec![0u8; PACKET_SIZE];
        let mut last_stats = Instant::now();

        while self.state.is_running() {
            // Readiness is edge-triggered: backlogged sockets will not be
            // reported again, so do not sleep while any are waiting
            let timeout = if self.backlog.is_empty() {
                self.config.poll_timeout()
            } else {
                Duration::ZERO
            };
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!("Relay poll failed: {}", e);
                    break;
                }
            }

            let retry = std::mem::take(&mut self.backlog);
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_pending(),
                    WAKER => {}
                    token => {
                        if event.is_error() {
                            self.schedule_removal(token, "socket error");
                            continue;
                        }
                        if event.is_readable() || event.is_read_closed() {
                            self.read_from(token, &mut buf);
                        }
                        if event.is_writable() {
                            self.write_to(token);
                        }
                    }
                }
            }
            for token in retry {
                self.read_from(token, &mut buf);
            }

            self.remove_closing();
            self.stats.queued.store(self.peers.queued(), Ordering::Relaxed);

            if let Some(interval) = self.config.stats_interval() {
                if last_stats.elapsed() >= interval {
                    last_stats = Instant::now();
                    let s = self.stats.snapshot();
                    tracing::info!(
                        "Relay stats: {} active, {} accepted, {} chunks in, {} relayed, {} dropped, {} queued",
                        s.active_connections,
                        s.connections_accepted,
                        s.chunks_received,
                        s.chunks_relayed,
                        s.chunks_dropped,
                        s.queued_chunks
                    );
                }
            }
        }

        self.shutdown();
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if let Err(e) = socket::prepare_accepted(&stream) {
                        tracing::debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
                    }

                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) = self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                    {
                        tracing::warn!("Failed to register {}: {}", addr, e);
                        continue;
                    }

                    self.peers.insert(token, stream, addr);
                    self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                    self.stats.active.store(self.peers.len(), Ordering::Relaxed);
                    tracing::info!("Connection from {}", addr);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn read_from(&mut self, token: Token, buf: &mut [u8]) {
        let mut payloads = Vec::new();
        let outcome = {
            let Some(peer) = self.peers.get_mut(token) else {
                return;
            };
            if peer.closing {
                return;
            }
            read_frames(peer, buf, &mut payloads, &self.stats)
        };

        for payload in payloads {
            if payload.is_empty() {
                continue;
            }
            self.stats.chunks_received.fetch_add(1, Ordering::Relaxed);

            let frame = match encode_frame(&payload) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Dropping chunk: {}", e);
                    continue;
                }
            };

            for peer_token in self.peers.broadcast(token, &frame, &self.stats) {
                self.enable_write(peer_token);
            }
        }

        match outcome {
            ReadOutcome::Drained => {}
            ReadOutcome::Backlog => {
                if !self.backlog.contains(&token) {
                    self.backlog.push(token);
                }
            }
            ReadOutcome::Closed(reason) => self.schedule_removal(token, &reason),
        }
    }

    fn write_to(&mut self, token: Token) {
        let registry = self.poll.registry();
        let Some(peer) = self.peers.get_mut(token) else {
            return;
        };
        if peer.closing {
            return;
        }

        let failure = loop {
            let frame = match peer.pending.take() {
                Some(frame) => frame,
                None => match peer.outbound.try_pop() {
                    Some(frame) => frame,
                    None => {
                        // Drained: stop asking for writability
                        if peer.write_registered {
                            peer.write_registered = false;
                            if let Err(e) = registry.reregister(&mut peer.stream, token, Interest::READABLE) {
                                break Some(format!("reregister failed: {}", e));
                            }
                        }
                        break None;
                    }
                },
            };

            match peer.stream.write(&frame) {
                Ok(0) => break Some("write returned zero".to_string()),
                Ok(n) => {
                    self.stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    if n < frame.len() {
                        peer.pending = Some(frame.slice(n..));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    peer.pending = Some(frame);
                    break None;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    peer.pending = Some(frame);
                }
                Err(e) => break Some(format!("send failed: {}", e)),
            }
        };

        if let Some(reason) = failure {
            self.schedule_removal(token, &reason);
        }
    }

    /// Add write interest; a fresh writable event follows if the socket
    /// can take data right now
    fn enable_write(&mut self, token: Token) {
        let registry = self.poll.registry();
        let result = match self.peers.get_mut(token) {
            Some(peer) => registry.reregister(
                &mut peer.stream,
                token,
                Interest::READABLE | Interest::WRITABLE,
            ),
            None => return,
        };
        if let Err(e) = result {
            self.schedule_removal(token, &format!("reregister failed: {}", e));
        }
    }

    fn schedule_removal(&mut self, token: Token, reason: &str) {
        if let Some(peer) = self.peers.get(token) {
            if !peer.closing {
                tracing::debug!("Closing {}: {}", peer.addr, reason);
            }
        }
        self.peers.mark_closing(token);
    }

    fn remove_closing(&mut self) {
        for token in self.peers.closing_tokens() {
            self.close_peer(token);
        }
        self.stats.active.store(self.peers.len(), Ordering::Relaxed);
    }

    fn close_peer(&mut self, token: Token) {
        let Some(mut peer) = self.peers.remove(token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut peer.stream);
        let _ = peer.stream.shutdown(Shutdown::Both);
        tracing::info!(
            "Disconnect from {} ({} queued chunks discarded)",
            peer.addr,
            peer.outbound.len()
        );
        // Socket and outbound queue are released here
    }

    fn shutdown(&mut self) {
        for token in self.peers.tokens() {
            self.close_peer(token);
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
        self.stats.active.store(0, Ordering::Relaxed);
        self.stats.queued.store(0, Ordering::Relaxed);
        self.state.set(RunState::Stopped);
        tracing::info!("Relay stopped");
    }
}

enum ReadOutcome {
    /// Socket returned `WouldBlock`
    Drained,
    /// Read cap reached with data possibly still waiting
    Backlog,
    /// Connection must be dropped
    Closed(String),
}

/// Read up to [`MAX_READS_PER_TURN`] times from a readable socket into
/// `payloads`. Complete frames read before a failure are still returned.
fn read_frames(
    peer: &mut Peer<TcpStream>,
    buf: &mut [u8],
    payloads: &mut Vec<Bytes>,
    stats: &RelayStats,
) -> ReadOutcome {
    let mut reads = 0;
    loop {
        if reads == MAX_READS_PER_TURN {
            return ReadOutcome::Backlog;
        }
        reads += 1;

        match peer.stream.read(buf) {
            Ok(0) => return ReadOutcome::Closed("closed by peer".to_string()),
            Ok(n) => {
                stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                peer.inbound.extend(&buf[..n]);
                loop {
                    match peer.inbound.next_frame() {
                        Ok(Some(payload)) => payloads.push(payload),
                        Ok(None) => break,
                        Err(e) => return ReadOutcome::Closed(e.to_string()),
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadOutcome::Drained,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadOutcome::Closed(format!("read failed: {}", e)),
        }
    }
}
