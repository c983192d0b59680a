//! Errors from the wire protocol layer.

use thiserror::Error;

/// Largest payload a textual frame header can declare (8 decimal digits).
pub const MAX_FRAME_LEN: usize = 99_999_999;

/// Errors from the wire protocol layer.
///
/// Every variant is a contained condition: none of them stops the acceptor or
/// dispatcher loops, and protocol errors only close the connection they
/// occurred on.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Connection refused by {addr}")]
    ConnectionRefused { addr: String },
    #[error("Connection reset by {addr}")]
    ConnectionReset { addr: String },
    #[error("Could not connect to {addr} after {attempts} attempts")]
    Unreachable { addr: String, attempts: u32 },
    #[error("Cannot bind port {port}: {reason}")]
    BindUnavailable { port: u16, reason: String },
    #[error("Not connected to {addr}")]
    NotConnected { addr: String },
    #[error("Message too long: {len} bytes (max {MAX_FRAME_LEN})")]
    MessageTooLong { len: usize },
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("Network start failed on port {port} after {attempts} attempts")]
    StartupFailed { port: u16, attempts: u32 },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl WireError {
    /// Classify an I/O error raised while talking to `addr`.
    pub fn from_io(err: std::io::Error, addr: impl ToString) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => Self::ConnectionRefused {
                addr: addr.to_string(),
            },
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Self::ConnectionReset {
                    addr: addr.to_string(),
                }
            }
            ErrorKind::NotConnected => Self::NotConnected {
                addr: addr.to_string(),
            },
            _ => Self::Io(err),
        }
    }

    /// Transient network conditions: logged and backlogged, never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused { .. }
                | Self::ConnectionReset { .. }
                | Self::NotConnected { .. }
                | Self::Unreachable { .. }
        )
    }

    /// Protocol conditions: fatal to the affected connection only.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_) | Self::Codec(_) | Self::MessageTooLong { .. }
        )
    }
}

impl From<peerlink_types::error::PeerLinkError> for WireError {
    fn from(err: peerlink_types::error::PeerLinkError) -> Self {
        match err {
            peerlink_types::error::PeerLinkError::UnsupportedCodec(name) => {
                Self::UnsupportedCodec(name)
            }
            peerlink_types::error::PeerLinkError::Io(e) => Self::Io(e),
            peerlink_types::error::PeerLinkError::ShuttingDown => Self::ShuttingDown,
            other => Self::Codec(other.to_string()),
        }
    }
}

/// Alias for wire-layer results.
pub type WireResult<T> = Result<T, WireError>;
