//! # Peer Connection
//!
//! One TCP stream to one peer, carrying framed [`Message`]s both ways.
//!
//! ```text
//!             start()           connect ok / accepted
//!   Setup ───────────▶ (connecting) ──────────────▶ Ready
//!     │                      │                        │
//!     │ stop()               │ error                  │ error / EOF / stop()
//!     ▼                      ▼                        ▼
//!  Cancelled              Failed               Failed | Cancelled
//! ```
//!
//! `Failed` and `Cancelled` are absorbing, and reaching either emits exactly
//! one event. Events go to whatever sink is attached at the time; with no
//! sink attached they are dropped.
//!
//! Each started connection runs a reader thread (which also performs the
//! outbound connect) and a writer thread draining the send queue. Both exit
//! once the socket is closed; neither is joined.
//!
//! After `stop()` the writer keeps flushing queued messages for at most
//! [`ConnectionConfig::flush_grace`]. A peer that has stopped reading cannot
//! hold the socket open past that; whatever is still queued is dropped.

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::ConnectionError;
use vidlink_transport::wire::{encode_message, Message, MessageDecoder, MessageType};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Writer socket timeout. Bounds how long a stalled write goes without
/// checking the flush deadline.
const WRITE_POLL: Duration = Duration::from_millis(100);

// ─── Identity ────────────────────────────────────────────────────────────────

/// Process-unique connection id. Distinguishes successive connections to
/// the same endpoint name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named peer address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub addr: SocketAddr,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Endpoint {
            name: name.into(),
            addr,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

// ─── State & Events ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Setup,
    Ready,
    Failed,
    Cancelled,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Cancelled)
    }
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Ready {
        id: ConnectionId,
        name: String,
    },
    Message {
        id: ConnectionId,
        name: String,
        message: Message,
    },
    SendFailed {
        id: ConnectionId,
        name: String,
        error: ConnectionError,
    },
    Failed {
        id: ConnectionId,
        name: String,
        error: ConnectionError,
    },
    Cancelled {
        id: ConnectionId,
        name: String,
    },
}

impl ConnectionEvent {
    pub fn id(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Ready { id, .. }
            | ConnectionEvent::Message { id, .. }
            | ConnectionEvent::SendFailed { id, .. }
            | ConnectionEvent::Failed { id, .. }
            | ConnectionEvent::Cancelled { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Encoded messages waiting for the writer before `send` fails.
    pub send_queue: usize,
    pub read_buffer: usize,
    /// How long queued messages may keep flushing after `stop()`.
    pub flush_grace: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            send_queue: 256,
            read_buffer: 64 * 1024,
            flush_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
}

// ─── Shared State ────────────────────────────────────────────────────────────

struct Shared {
    id: ConnectionId,
    name: String,
    state: Mutex<ConnectionState>,
    sink: ArcSwapOption<Sender<ConnectionEvent>>,
    /// Clone of the live socket, for shutting it down from `stop`.
    socket: Mutex<Option<TcpStream>>,
    writer_tx: Mutex<Option<Sender<Bytes>>>,
    closed_at: Mutex<Option<Instant>>,
    stats: Mutex<ConnectionStats>,
}

impl Shared {
    fn emit(&self, event: ConnectionEvent) {
        if let Some(sink) = self.sink.load_full() {
            let _ = sink.send(event);
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `to` unless already terminal. Returns whether the move
    /// happened.
    fn transition(&self, to: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_terminal() || *state == to {
            return false;
        }
        debug!(conn = %self.id, peer = %self.name, from = ?*state, to = ?to, "connection state");
        *state = to;
        true
    }

    fn fail(&self, error: ConnectionError) {
        if self.transition(ConnectionState::Failed) {
            warn!(conn = %self.id, peer = %self.name, error = %error, "connection failed");
            self.close();
            self.emit(ConnectionEvent::Failed {
                id: self.id,
                name: self.name.clone(),
                error,
            });
        }
    }

    /// Close the send queue and wake the reader. The writer drains what is
    /// left until the flush deadline.
    fn close(&self) {
        self.closed_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert_with(Instant::now);
        self.writer_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(socket) = self.socket.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            let _ = socket.shutdown(Shutdown::Read);
        }
    }

    fn flush_expired(&self, grace: Duration) -> bool {
        self.closed_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|at| at.elapsed() >= grace)
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, ConnectionStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Peer Connection ─────────────────────────────────────────────────────────

enum Origin {
    Outbound(SocketAddr),
    Inbound(TcpStream),
}

struct Pending {
    origin: Origin,
    writer_rx: Receiver<Bytes>,
}

pub struct PeerConnection {
    shared: Arc<Shared>,
    peer_addr: SocketAddr,
    config: ConnectionConfig,
    pending: Mutex<Option<Pending>>,
}

impl PeerConnection {
    /// A connection that will dial `endpoint` when started.
    pub fn outbound(endpoint: &Endpoint, config: ConnectionConfig) -> Self {
        Self::build(
            endpoint.name.clone(),
            endpoint.addr,
            Origin::Outbound(endpoint.addr),
            config,
        )
    }

    /// A connection around a stream accepted by a listener.
    pub fn inbound(stream: TcpStream, name: String, config: ConnectionConfig) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        Ok(Self::build(name, peer_addr, Origin::Inbound(stream), config))
    }

    fn build(name: String, peer_addr: SocketAddr, origin: Origin, config: ConnectionConfig) -> Self {
        let (writer_tx, writer_rx) = bounded(config.send_queue.max(1));
        PeerConnection {
            shared: Arc::new(Shared {
                id: ConnectionId::next(),
                name,
                state: Mutex::new(ConnectionState::Setup),
                sink: ArcSwapOption::empty(),
                socket: Mutex::new(None),
                writer_tx: Mutex::new(Some(writer_tx)),
                closed_at: Mutex::new(None),
                stats: Mutex::new(ConnectionStats::default()),
            }),
            peer_addr,
            config,
            pending: Mutex::new(Some(Pending { origin, writer_rx })),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.stats().clone()
    }

    /// Install the event sink, replacing any previous one.
    pub fn attach(&self, sink: Sender<ConnectionEvent>) {
        self.shared.sink.store(Some(Arc::new(sink)));
    }

    /// Remove the event sink. Later events are dropped.
    pub fn detach(&self) {
        self.shared.sink.store(None);
    }

    /// Spawn the I/O threads. Outbound connections dial from the reader
    /// thread, so this returns before the connection is ready.
    pub fn start(&self) -> Result<(), ConnectionError> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ConnectionError::AlreadyStarted)?;
        if self.state().is_terminal() {
            return Err(ConnectionError::NotConnected);
        }
        let shared = self.shared.clone();
        let config = self.config;
        thread::Builder::new()
            .name(format!("vidlink-conn-{}", self.shared.id.0))
            .spawn(move || run(shared, pending, config))
            .map_err(ConnectionError::Spawn)?;
        Ok(())
    }

    /// Queue one message. Failures are reported as
    /// [`ConnectionEvent::SendFailed`], never returned.
    pub fn send(&self, message_type: MessageType, payload: &[u8]) {
        let tx = self
            .shared
            .writer_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let error = match tx {
            None => ConnectionError::NotConnected,
            Some(tx) => match tx.try_send(encode_message(message_type, payload)) {
                Ok(()) => {
                    trace!(conn = %self.shared.id, ty = %message_type, len = payload.len(), "queued");
                    return;
                }
                Err(TrySendError::Full(_)) => {
                    warn!(conn = %self.shared.id, peer = %self.shared.name, ty = %message_type, "send queue full, dropping message");
                    ConnectionError::QueueFull
                }
                Err(TrySendError::Disconnected(_)) => ConnectionError::NotConnected,
            },
        };
        self.shared.stats().send_failures += 1;
        self.shared.emit(ConnectionEvent::SendFailed {
            id: self.shared.id,
            name: self.shared.name.clone(),
            error,
        });
    }

    /// Cancel the connection. Idempotent; a no-op once terminal.
    ///
    /// Messages already queued are still written before the socket closes,
    /// for up to [`ConnectionConfig::flush_grace`].
    pub fn stop(&self) {
        if self.shared.transition(ConnectionState::Cancelled) {
            info!(conn = %self.shared.id, peer = %self.shared.name, "connection cancelled");
            self.shared.close();
            self.shared.emit(ConnectionEvent::Cancelled {
                id: self.shared.id,
                name: self.shared.name.clone(),
            });
        }
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─── I/O Threads ─────────────────────────────────────────────────────────────

fn run(shared: Arc<Shared>, pending: Pending, config: ConnectionConfig) {
    let stream = match pending.origin {
        Origin::Inbound(stream) => stream,
        Origin::Outbound(addr) => match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(source) => {
                shared.fail(ConnectionError::Connect { addr, source });
                return;
            }
        },
    };
    let _ = stream.set_nodelay(true);

    let clones = stream.try_clone().and_then(|w| Ok((w, stream.try_clone()?)));
    let (writer_stream, control_stream) = match clones {
        Ok(pair) => pair,
        Err(e) => {
            shared.fail(ConnectionError::Read(e));
            return;
        }
    };

    {
        let mut slot = shared.socket.lock().unwrap_or_else(|e| e.into_inner());
        if shared.state().is_terminal() {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        *slot = Some(control_stream);
    }
    if !shared.transition(ConnectionState::Ready) {
        let _ = stream.shutdown(Shutdown::Both);
        return;
    }
    info!(conn = %shared.id, peer = %shared.name, "connection ready");
    shared.emit(ConnectionEvent::Ready {
        id: shared.id,
        name: shared.name.clone(),
    });

    if let Err(e) = writer_stream.set_write_timeout(Some(WRITE_POLL)) {
        shared.fail(ConnectionError::Write(e));
        return;
    }
    let writer_shared = shared.clone();
    let grace = config.flush_grace;
    let spawned = thread::Builder::new()
        .name(format!("vidlink-send-{}", shared.id.0))
        .spawn(move || write_loop(writer_shared, writer_stream, pending.writer_rx, grace));
    if let Err(e) = spawned {
        shared.fail(ConnectionError::Spawn(e));
        return;
    }

    read_loop(&shared, stream, config.read_buffer);
}

fn read_loop(shared: &Shared, mut stream: TcpStream, buffer_size: usize) {
    let mut decoder = MessageDecoder::new();
    let mut buf = vec![0u8; buffer_size.max(1024)];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                shared.fail(ConnectionError::PeerClosed);
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                shared.fail(ConnectionError::Read(e));
                return;
            }
        };
        shared.stats().bytes_received += n as u64;

        if let Err(e) = decoder.push(&buf[..n]) {
            shared.fail(e.into());
            return;
        }
        for message in decoder.drain_messages() {
            shared.stats().messages_received += 1;
            trace!(conn = %shared.id, ty = %message.message_type(), len = message.payload.len(), "received");
            shared.emit(ConnectionEvent::Message {
                id: shared.id,
                name: shared.name.clone(),
                message,
            });
        }
    }
}

fn write_loop(shared: Arc<Shared>, mut stream: TcpStream, writer_rx: Receiver<Bytes>, grace: Duration) {
    for frame in writer_rx {
        match write_frame(&shared, &mut stream, &frame, grace) {
            Ok(true) => {}
            Ok(false) => {
                debug!(conn = %shared.id, peer = %shared.name, "flush deadline passed, dropping queued messages");
                break;
            }
            Err(e) => {
                let kind = e.kind();
                shared.stats().send_failures += 1;
                shared.emit(ConnectionEvent::SendFailed {
                    id: shared.id,
                    name: shared.name.clone(),
                    error: ConnectionError::Write(e),
                });
                shared.fail(ConnectionError::Write(io::Error::from(kind)));
                break;
            }
        }
        let mut stats = shared.stats();
        stats.messages_sent += 1;
        stats.bytes_sent += frame.len() as u64;
    }
    let _ = stream.shutdown(Shutdown::Both);
    debug!(conn = %shared.id, "writer exiting");
}

/// Write one whole frame. Returns `Ok(false)` if the connection was closed
/// and its flush deadline passed before the frame went out.
fn write_frame(shared: &Shared, stream: &mut TcpStream, frame: &[u8], grace: Duration) -> io::Result<bool> {
    let mut written = 0;
    while written < frame.len() {
        match stream.write(&frame[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if shared.flush_expired(grace) {
                    return Ok(false);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
