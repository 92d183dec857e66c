//! Crate-wide error type.

use std::net::SocketAddr;
use std::time::Duration;

use crate::compression::CompressionError;

/// Errors produced by codecs, framing, connections, clients, and servers.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Truncated or malformed payload / frame.
    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),

    /// A frame body exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared or computed body size.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The peer closed the connection, or it was closed locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// The client has no live connection.
    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    /// The peer sent something other than a valid handshake first.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The component is shutting down and refuses new work.
    #[error("shutting down")]
    Stopping,

    #[error(transparent)]
    Compression(#[from] CompressionError),

    /// A value could not be serialized as a JSON client payload.
    #[error("json encode failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// Whether this error means the underlying stream is gone.
    pub fn is_disconnect(&self) -> bool {
        match self {
            NetError::ConnectionClosed => true,
            NetError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            NetError::WebSocket(e) => matches!(
                e,
                tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    | tokio_tungstenite::tungstenite::Error::AlreadyClosed
            ),
            _ => false,
        }
    }
}

/// Shorthand result used across the crate.
pub type NetResult<T> = Result<T, NetError>;
