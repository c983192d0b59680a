//! Kernel-specific error types.

use peerlink_types::error::PeerLinkError;
use peerlink_wire::WireError;
use thiserror::Error;

/// Kernel error type wrapping the lower layers with kernel-specific context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped PeerLinkError.
    #[error(transparent)]
    PeerLink(#[from] PeerLinkError),

    /// A transport failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The platform failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),

    /// An agent with this name is already hosted here.
    #[error("Agent already registered: {0}")]
    AgentExists(String),

    /// No local agent with this name.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
