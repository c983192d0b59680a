//! PeerLink transport: platform-to-platform networking.
//!
//! Lets platforms discover each other over TCP, keep a per-peer view of the
//! agents hosted remotely, and detect peers that stopped answering.
//!
//! ## Architecture
//!
//! - **Codec / framing**: pluggable message encoding, length-prefixed for
//!   textual codecs
//! - **ConnectionRegistry**: open links keyed by [`ConnectionIdentity`]
//! - **Acceptor / Dispatcher**: inbound listener and outbound send loop
//! - **Propagation**: the directory synchronization state machine
//! - **HeartbeatDetector**: evicts links whose peer went silent
//! - **NetworkNode**: wires the above together around injected collaborators

pub mod acceptor;
pub mod backlog;
pub mod codec;
pub mod collaborators;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod heartbeat;
pub mod identity;
pub mod node;
pub mod propagation;
pub mod registry;

pub use backlog::{OutboundBacklog, UnsentMessage};
pub use codec::{codec_for, WireCodec};
pub use collaborators::{Collaborators, Directory, EventSink, LocalDelivery};
pub use connection::{Connection, ConnectionState, Direction};
pub use error::{WireError, WireResult};
pub use heartbeat::{HeartbeatDetector, HeartbeatSettings};
pub use identity::ConnectionIdentity;
pub use node::NetworkNode;
pub use propagation::{Delivery, Outcome, Propagation};
pub use registry::ConnectionRegistry;
