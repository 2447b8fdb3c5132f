//! # Session
//!
//! Owns a set of [`PeerConnection`]s keyed by endpoint name and turns their
//! events into [`SessionEvent`]s and [`VideoEvent`]s.
//!
//! ```text
//!  PeerConnection ─┐
//!  PeerConnection ─┼─▶ conn events ─▶ dispatcher ─┬─▶ SessionEvent channel
//!  PeerConnection ─┘                  (thread)    └─▶ VideoEvent channel
//! ```
//!
//! At most one connection per name is live. Every connection carries a
//! process-unique id, and the dispatcher only removes an entry whose id
//! matches the event, so a late event from a replaced connection cannot
//! remove its successor. Connections are detached from the event channel
//! before they are stopped.

use arc_swap::ArcSwap;
use bytes::Bytes;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::connection::{
    ConnectionConfig, ConnectionEvent, ConnectionId, ConnectionState, Endpoint, PeerConnection,
};
use crate::discovery::Discovery;
use crate::error::ConnectionError;
use vidlink_transport::wire::{MessageType, DISCONNECT_PAYLOAD};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Streamer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Host => "host",
            Role::Streamer => "streamer",
        })
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// This node's own name. Discovery results carrying it are ignored.
    pub name: String,
    pub role: Role,
    pub connection: ConnectionConfig,
    pub event_capacity: usize,
    pub video_capacity: usize,
}

impl SessionConfig {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        SessionConfig {
            name: name.into(),
            role,
            connection: ConnectionConfig::default(),
            event_capacity: 256,
            video_capacity: 512,
        }
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The discovered peer set changed.
    PeersChanged(Vec<Endpoint>),
    Connected { peer: String },
    ConnectionFailed { peer: String, error: String },
    /// The connection was cancelled without the session asking for it.
    ConnectionClosed { peer: String },
    Text { peer: String, text: String },
    /// The peer sent a disconnect notice; its connection has been removed.
    PeerDisconnected { peer: String },
    SendFailed { peer: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoEvent {
    /// One `VideoData` payload: a slice of the peer's Annex-B stream.
    Data { peer: String, data: Bytes },
    /// The peer's connection is gone; no more data follows for it.
    End { peer: String },
}

/// Snapshot of one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub name: String,
    pub addr: SocketAddr,
    pub state: ConnectionState,
}

// ─── Shared State ────────────────────────────────────────────────────────────

struct Shared {
    config: SessionConfig,
    connections: Mutex<HashMap<String, Arc<PeerConnection>>>,
    /// Published copy of `connections` for lock-free fan-out.
    live: ArcSwap<Vec<Arc<PeerConnection>>>,
    discovered: ArcSwap<Vec<Endpoint>>,
    discovery: Mutex<Option<Box<dyn Discovery>>>,
    conn_tx: Sender<ConnectionEvent>,
    event_tx: Sender<SessionEvent>,
    video_tx: Sender<VideoEvent>,
}

impl Shared {
    fn publish(&self, map: &HashMap<String, Arc<PeerConnection>>) {
        let mut live: Vec<_> = map.values().cloned().collect();
        live.sort_by(|a, b| a.name().cmp(b.name()));
        self.live.store(Arc::new(live));
    }

    fn find(&self, id: ConnectionId) -> Option<Arc<PeerConnection>> {
        self.live.load().iter().find(|c| c.id() == id).cloned()
    }

    /// Remove the entry for `name` only if it is still connection `id`.
    fn remove_if_id(&self, name: &str, id: ConnectionId) -> Option<Arc<PeerConnection>> {
        let removed = {
            let mut map = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            match map.get(name) {
                Some(conn) if conn.id() == id => {
                    let conn = map.remove(name);
                    self.publish(&map);
                    conn
                }
                _ => None,
            }
        };
        if let Some(conn) = &removed {
            conn.detach();
            conn.stop();
            self.end_video(name);
        }
        removed
    }

    fn emit(&self, event: SessionEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(?event, "session event queue full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn end_video(&self, peer: &str) {
        if let Err(TrySendError::Full(_)) = self.video_tx.try_send(VideoEvent::End {
            peer: peer.to_string(),
        }) {
            warn!(peer, "video queue full, dropping end-of-stream");
        }
    }

    /// Queue video from connection `id`, unless it has been removed. Checked
    /// under the map lock so no data follows the `End` a removal sends.
    fn forward_video(&self, id: ConnectionId, peer: String, data: Bytes) {
        let map = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if map.get(&peer).map(|c| c.id()) != Some(id) {
            trace!(conn = %id, "video from removed connection dropped");
            return;
        }
        if let Err(TrySendError::Full(_)) = self.video_tx.try_send(VideoEvent::Data { peer, data }) {
            warn!(conn = %id, "video queue full, dropping payload");
        }
    }

    fn handle(&self, event: ConnectionEvent) {
        let id = event.id();
        if self.find(id).is_none() {
            trace!(conn = %id, "event for unknown connection ignored");
            return;
        }

        match event {
            ConnectionEvent::Ready { name, .. } => {
                info!(peer = %name, role = %self.config.role, "peer connected");
                self.emit(SessionEvent::Connected { peer: name });
            }
            ConnectionEvent::Message { name, message, .. } => match message.message_type() {
                MessageType::VideoData => self.forward_video(id, name, message.payload),
                MessageType::Text => {
                    let text = String::from_utf8_lossy(&message.payload).into_owned();
                    debug!(peer = %name, %text, "text message");
                    self.emit(SessionEvent::Text { peer: name, text });
                }
                MessageType::Disconnect => {
                    info!(peer = %name, "peer sent disconnect");
                    self.remove_if_id(&name, id);
                    self.emit(SessionEvent::PeerDisconnected { peer: name });
                }
                MessageType::Invalid => {
                    warn!(
                        peer = %name,
                        raw_type = message.header.raw_type,
                        len = message.payload.len(),
                        "ignoring message with unknown type"
                    );
                }
            },
            ConnectionEvent::SendFailed { name, error, .. } => {
                self.emit(SessionEvent::SendFailed {
                    peer: name,
                    error: error.to_string(),
                });
            }
            ConnectionEvent::Failed { name, error, .. } => {
                self.remove_if_id(&name, id);
                self.emit(SessionEvent::ConnectionFailed {
                    peer: name,
                    error: error.to_string(),
                });
            }
            ConnectionEvent::Cancelled { name, .. } => {
                self.remove_if_id(&name, id);
                self.emit(SessionEvent::ConnectionClosed { peer: name });
            }
        }
    }
}

// ─── Handle ──────────────────────────────────────────────────────────────────

/// Cloneable access to a running [`Session`].
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn role(&self) -> Role {
        self.shared.config.role
    }

    /// Dial `endpoint` and add the connection, replacing any live
    /// connection with the same name.
    pub fn create_connection(&self, endpoint: &Endpoint) -> Result<ConnectionId, ConnectionError> {
        let conn = PeerConnection::outbound(endpoint, self.shared.config.connection);
        self.install(conn)
    }

    /// Add a connection for a stream accepted by a listener. The peer is
    /// named after its socket address.
    pub fn adopt(&self, stream: TcpStream) -> Result<ConnectionId, ConnectionError> {
        let name = stream.peer_addr().map_err(ConnectionError::Read)?.to_string();
        let conn = PeerConnection::inbound(stream, name, self.shared.config.connection)
            .map_err(ConnectionError::Read)?;
        self.install(conn)
    }

    fn install(&self, conn: PeerConnection) -> Result<ConnectionId, ConnectionError> {
        conn.attach(self.shared.conn_tx.clone());
        let conn = Arc::new(conn);
        let id = conn.id();
        let name = conn.name().to_string();

        let replaced = {
            let mut map = self.shared.connections.lock().unwrap_or_else(|e| e.into_inner());
            let replaced = map.insert(name.clone(), conn.clone());
            self.shared.publish(&map);
            replaced
        };
        if let Some(old) = replaced {
            info!(peer = %name, old = %old.id(), new = %id, "replacing existing connection");
            old.detach();
            old.stop();
            self.shared.end_video(&name);
        }

        if let Err(e) = conn.start() {
            self.shared.remove_if_id(&name, id);
            return Err(e);
        }
        debug!(peer = %name, conn = %id, addr = %conn.peer_addr(), "connection added");
        Ok(id)
    }

    /// Detach, stop and forget the connection named `name`. Returns whether
    /// one existed.
    pub fn remove_connection(&self, name: &str) -> bool {
        let removed = {
            let mut map = self.shared.connections.lock().unwrap_or_else(|e| e.into_inner());
            let removed = map.remove(name);
            self.shared.publish(&map);
            removed
        };
        match removed {
            Some(conn) => {
                conn.detach();
                conn.stop();
                self.shared.end_video(name);
                info!(peer = %name, conn = %conn.id(), "connection removed");
                true
            }
            None => false,
        }
    }

    /// Best-effort send to every live connection.
    pub fn broadcast(&self, message_type: MessageType, payload: &[u8]) {
        for conn in self.shared.live.load().iter() {
            conn.send(message_type, payload);
        }
    }

    /// Send to the connection named `name`. Returns whether it exists.
    pub fn send_to(&self, name: &str, message_type: MessageType, payload: &[u8]) -> bool {
        match self.shared.live.load().iter().find(|c| c.name() == name) {
            Some(conn) => {
                conn.send(message_type, payload);
                true
            }
            None => false,
        }
    }

    pub fn send_disconnect_to_all(&self) {
        self.broadcast(MessageType::Disconnect, DISCONNECT_PAYLOAD);
    }

    pub fn send_disconnect(&self, name: &str) -> bool {
        self.send_to(name, MessageType::Disconnect, DISCONNECT_PAYLOAD)
    }

    /// Stop discovery and drop every connection.
    pub fn close_all(&self) {
        if let Some(mut discovery) = self
            .shared
            .discovery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            discovery.stop();
        }

        let drained: Vec<_> = {
            let mut map = self.shared.connections.lock().unwrap_or_else(|e| e.into_inner());
            let drained = map.drain().collect();
            self.shared.publish(&map);
            drained
        };
        for (name, conn) in drained {
            conn.detach();
            conn.stop();
            self.shared.end_video(&name);
        }
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared
            .live
            .load()
            .iter()
            .map(|c| ConnectionInfo {
                id: c.id(),
                name: c.name().to_string(),
                addr: c.peer_addr(),
                state: c.state(),
            })
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.live.load().len()
    }

    pub fn discovered_peers(&self) -> Arc<Vec<Endpoint>> {
        self.shared.discovered.load_full()
    }

    /// Replace the discovered peer set, dropping entries with this
    /// session's own name.
    pub fn update_discovered(&self, results: Vec<Endpoint>) {
        let own = &self.shared.config.name;
        let peers: Vec<Endpoint> = results.into_iter().filter(|p| &p.name != own).collect();
        debug!(count = peers.len(), "discovered peers updated");
        self.shared.discovered.store(Arc::new(peers.clone()));
        self.shared.emit(SessionEvent::PeersChanged(peers));
    }

    /// Start `discovery`, feeding its results into this session. A
    /// previously started discovery is stopped first.
    pub fn start_discovery(&self, mut discovery: Box<dyn Discovery>) -> std::io::Result<()> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        discovery.start(Box::new(move |results| {
            if let Some(shared) = weak.upgrade() {
                SessionHandle { shared }.update_discovered(results);
            }
        }))?;
        let previous = self
            .shared
            .discovery
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(discovery);
        if let Some(mut previous) = previous {
            previous.stop();
        }
        Ok(())
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// A running session: the dispatcher thread plus the outward channels.
///
/// Dropping the session closes every connection and joins the dispatcher.
pub struct Session {
    handle: SessionHandle,
    events: Receiver<SessionEvent>,
    video: Receiver<VideoEvent>,
    stop_tx: Option<Sender<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> std::io::Result<Self> {
        // Unbounded: connection threads must never block on the dispatcher.
        let (conn_tx, conn_rx) = unbounded();
        let (event_tx, events) = bounded(config.event_capacity.max(1));
        let (video_tx, video) = bounded(config.video_capacity.max(1));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        info!(name = %config.name, role = %config.role, "session starting");
        let shared = Arc::new(Shared {
            config,
            connections: Mutex::new(HashMap::new()),
            live: ArcSwap::from_pointee(Vec::new()),
            discovered: ArcSwap::from_pointee(Vec::new()),
            discovery: Mutex::new(None),
            conn_tx,
            event_tx,
            video_tx,
        });

        let worker = shared.clone();
        let dispatcher = thread::Builder::new()
            .name("vidlink-session".into())
            .spawn(move || dispatch(worker, conn_rx, stop_rx))?;

        Ok(Session {
            handle: SessionHandle { shared },
            events,
            video,
            stop_tx: Some(stop_tx),
            dispatcher: Some(dispatcher),
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events.clone()
    }

    pub fn video(&self) -> Receiver<VideoEvent> {
        self.video.clone()
    }

    /// Close all connections and stop the dispatcher. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        self.handle.close_all();
        let _ = stop_tx.send(());
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
        info!(name = %self.handle.name(), "session stopped");
    }
}

impl Deref for Session {
    type Target = SessionHandle;

    fn deref(&self) -> &SessionHandle {
        &self.handle
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch(shared: Arc<Shared>, conn_rx: Receiver<ConnectionEvent>, stop_rx: Receiver<()>) {
    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(conn_rx) -> event => match event {
                Ok(event) => shared.handle(event),
                Err(_) => break,
            },
        }
    }
    debug!("session dispatcher exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticDiscovery;
    use std::net::TcpListener;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn session(name: &str, role: Role) -> Session {
        Session::new(SessionConfig::new(name, role)).unwrap()
    }

    #[test]
    fn create_then_remove_leaves_nothing_behind() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::new("streamer", listener.local_addr().unwrap());
        let host = session("host", Role::Host);
        let events = host.events();

        host.create_connection(&endpoint).unwrap();
        assert_eq!(host.connection_count(), 1);
        assert!(host.remove_connection("streamer"));
        assert!(host.connections().is_empty());
        assert!(!host.remove_connection("streamer"));

        // A Ready that beat the removal is fine; nothing terminal may follow.
        thread::sleep(Duration::from_millis(300));
        let seen: Vec<_> = events.try_iter().collect();
        assert!(
            seen.iter().all(|e| matches!(e, SessionEvent::Connected { .. })),
            "unexpected events after removal: {seen:?}"
        );
        assert!(host.connections().is_empty());
    }

    #[test]
    fn no_video_follows_end_of_removed_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::new("streamer", listener.local_addr().unwrap());
        let host = session("host", Role::Host);
        let video = host.video();
        let id = host.create_connection(&endpoint).unwrap();
        let shared = &host.handle.shared;

        shared.forward_video(id, "streamer".into(), Bytes::from_static(&[0, 0, 0, 1, 0x65]));
        assert!(host.remove_connection("streamer"));
        // A dispatcher that looked the connection up before the removal.
        shared.forward_video(id, "streamer".into(), Bytes::from_static(&[0, 0, 0, 1, 0x41]));

        let seen: Vec<_> = video.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                VideoEvent::Data {
                    peer: "streamer".into(),
                    data: Bytes::from_static(&[0, 0, 0, 1, 0x65])
                },
                VideoEvent::End {
                    peer: "streamer".into()
                },
            ]
        );
    }

    #[test]
    fn create_connection_replaces_same_name() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::new("streamer", listener.local_addr().unwrap());
        let host = session("host", Role::Host);

        let first = host.create_connection(&endpoint).unwrap();
        let second = host.create_connection(&endpoint).unwrap();
        assert_ne!(first, second);
        let conns = host.connections();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].id, second);
    }

    #[test]
    fn failed_connection_is_removed_and_reported() {
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let host = session("host", Role::Host);
        let events = host.events();

        host.create_connection(&Endpoint::new("gone", addr)).unwrap();
        match events.recv_timeout(TIMEOUT).unwrap() {
            SessionEvent::ConnectionFailed { peer, .. } => assert_eq!(peer, "gone"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(host.connection_count(), 0);
    }

    #[test]
    fn update_discovered_filters_own_name() {
        let host = session("host", Role::Host);
        let events = host.events();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();

        host.start_discovery(Box::new(StaticDiscovery::new(vec![
            Endpoint::new("host", addr),
            Endpoint::new("camera", addr),
        ])))
        .unwrap();

        let peers = host.discovered_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "camera");
        assert_eq!(
            events.recv_timeout(TIMEOUT).unwrap(),
            SessionEvent::PeersChanged(vec![Endpoint::new("camera", addr)])
        );
    }

    #[test]
    fn send_to_unknown_peer_reports_missing() {
        let host = session("host", Role::Host);
        assert!(!host.send_to("nobody", MessageType::Text, b"hi"));
        assert!(!host.send_disconnect("nobody"));
        host.broadcast(MessageType::Text, b"no one listening");
    }

    #[test]
    fn text_and_disconnect_from_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::new("streamer", listener.local_addr().unwrap());

        let streamer = session("streamer", Role::Streamer);
        let host = session("host", Role::Host);
        let host_events = host.events();
        let streamer_events = streamer.events();

        host.create_connection(&endpoint).unwrap();
        let (stream, _) = listener.accept().unwrap();
        streamer.adopt(stream).unwrap();

        assert!(matches!(host_events.recv_timeout(TIMEOUT).unwrap(), SessionEvent::Connected { .. }));
        assert!(matches!(streamer_events.recv_timeout(TIMEOUT).unwrap(), SessionEvent::Connected { .. }));

        streamer.broadcast(MessageType::Text, b"rolling");
        assert_eq!(
            host_events.recv_timeout(TIMEOUT).unwrap(),
            SessionEvent::Text {
                peer: "streamer".into(),
                text: "rolling".into()
            }
        );

        streamer.send_disconnect_to_all();
        assert_eq!(
            host_events.recv_timeout(TIMEOUT).unwrap(),
            SessionEvent::PeerDisconnected {
                peer: "streamer".into()
            }
        );
        assert_eq!(host.connection_count(), 0);

        // Removal on the host closes the socket; the streamer sees it.
        match streamer_events.recv_timeout(TIMEOUT).unwrap() {
            SessionEvent::ConnectionFailed { .. } | SessionEvent::ConnectionClosed { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(streamer.connection_count(), 0);
    }
}
