//! # vidlink-session
//!
//! Peer-to-peer plumbing for the vidlink LAN video link.
//!
//! A streamer accepts hosts through a [`PeerListener`] and broadcasts its
//! encoded stream; a host discovers streamers, dials them and decodes what
//! arrives. Both sides run a [`Session`] that owns the TCP connections.
//!
//! ## Crate structure
//!
//! - [`connection`]: one framed TCP stream with lifecycle events
//! - [`session`]: connection set, event dispatch and fan-out
//! - [`listener`]: inbound TCP accept loop
//! - [`discovery`]: pluggable peer discovery
//! - [`pipeline`]: codec stages wired to a session
//! - [`config`]: TOML node configuration

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod listener;
pub mod pipeline;
pub mod session;

pub use config::{NodeConfig, CONFIG_VERSION};
pub use connection::{ConnectionEvent, ConnectionId, ConnectionState, Endpoint, PeerConnection};
pub use discovery::{Discovery, StaticDiscovery};
pub use error::{ConfigError, ConnectionError};
pub use listener::PeerListener;
pub use pipeline::{HostPipeline, PipelineConfig, StreamerPipeline};
pub use session::{Role, Session, SessionConfig, SessionEvent, SessionHandle, VideoEvent};
