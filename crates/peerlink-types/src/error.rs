//! Shared error types for PeerLink.

use thiserror::Error;

/// Top-level error type shared across PeerLink crates.
#[derive(Error, Debug)]
pub enum PeerLinkError {
    /// A configuration value is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The configured codec name is not one of the supported codecs.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// A network error occurred.
    #[error("Network error: {0}")]
    Network(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The platform is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Alias for Result with PeerLinkError.
pub type PeerLinkResult<T> = Result<T, PeerLinkError>;
