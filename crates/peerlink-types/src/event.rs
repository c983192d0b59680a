//! Events raised by the network subsystem.
//!
//! The transport never calls into higher layers directly for notifications:
//! every peer-level change is published as a [`NetworkEvent`] through the
//! event sink the transport was constructed with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Create a new random EventId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network-related notification.
///
/// Peer addresses are the remote platform's listening address rendered as
/// `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum NetworkEvent {
    /// A connection was registered.
    PeerConnected {
        /// Remote address of the new link.
        address: String,
    },
    /// A connection was removed from the registry.
    PeerDisconnected {
        /// Remote address of the closed link.
        address: String,
    },
    /// Both sides exchanged a full directory dump.
    PeerSynchronized {
        /// The synchronized peer.
        address: String,
    },
    /// The peer announced its own shutdown.
    PeerShutdown {
        /// The departing peer.
        address: String,
    },
    /// A peer's agent directory changed.
    DirectoryChanged {
        /// The peer whose directory changed.
        address: String,
        /// Number of agent names added.
        added: usize,
        /// Number of agent names removed.
        removed: usize,
    },
    /// A peer announced where it can be reached.
    LocationReceived {
        /// The announcing peer.
        address: String,
        /// The announced location.
        location: String,
    },
    /// The listener could not bind on the first attempt.
    NetworkStartDelayed {
        /// Port that was busy.
        port: u16,
    },
    /// The listener gave up binding.
    NetworkStartFailed {
        /// Last port tried.
        port: u16,
        /// Number of failed attempts.
        attempts: u32,
    },
    /// The listener is accepting connections.
    NetworkStarted {
        /// Bound address.
        address: String,
    },
}

impl NetworkEvent {
    /// Short machine-friendly name of the variant.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PeerConnected { .. } => "peer_connected",
            Self::PeerDisconnected { .. } => "peer_disconnected",
            Self::PeerSynchronized { .. } => "peer_synchronized",
            Self::PeerShutdown { .. } => "peer_shutdown",
            Self::DirectoryChanged { .. } => "directory_changed",
            Self::LocationReceived { .. } => "location_received",
            Self::NetworkStartDelayed { .. } => "network_start_delayed",
            Self::NetworkStartFailed { .. } => "network_start_failed",
            Self::NetworkStarted { .. } => "network_started",
        }
    }
}

/// A published event with its identity and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub id: EventId,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub payload: NetworkEvent,
}

impl Event {
    /// Wrap a payload with a fresh id and the current time.
    pub fn new(payload: NetworkEvent) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            payload,
        }
    }
}
