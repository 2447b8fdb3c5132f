use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use vidlink_transport::wire::FrameError;

/// Connection-level failures. Delivered inside connection events rather
/// than returned, except where noted.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connect to {addr} failed")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("read failed")]
    Read(#[source] io::Error),
    #[error("write failed")]
    Write(#[source] io::Error),
    #[error("peer closed the stream")]
    PeerClosed,
    #[error("framing error")]
    Frame(#[from] FrameError),
    #[error("send queue full")]
    QueueFull,
    #[error("connection is not open")]
    NotConnected,
    /// Returned by `start`.
    #[error("connection already started")]
    AlreadyStarted,
    /// Returned by `start`.
    #[error("failed to spawn connection thread")]
    Spawn(#[source] io::Error),
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid [{section}] setting: {reason}")]
    Invalid {
        section: &'static str,
        reason: String,
    },
}
