//! Contracts the transport consumes from the rest of the platform.
//!
//! The transport does not own the agent directory, local message delivery or
//! the event bus. The kernel implements these traits and injects them when it
//! constructs a [`crate::NetworkNode`]. All implementations must be safe for
//! concurrent use: the acceptor, the dispatcher, the heartbeat loop and every
//! connection reader call into them from different tasks.

use peerlink_types::event::NetworkEvent;
use peerlink_types::message::Message;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

/// The distributed agent directory, keyed by peer listening address.
pub trait Directory: Send + Sync + 'static {
    /// Record `name` as hosted on `peer`. Returns false if it was already known.
    fn add_remote_agent_name(&self, name: &str, peer: SocketAddr) -> bool;

    /// Forget `name` on `peer`. Returns false if it was not known.
    fn remove_remote_agent_name(&self, name: &str, peer: SocketAddr) -> bool;

    /// Whether a directory entry exists for `peer`.
    fn is_peer_known(&self, peer: SocketAddr) -> bool;

    /// Create an empty, unsynced entry for `peer` if none exists.
    fn ensure_peer(&self, peer: SocketAddr);

    fn mark_synced(&self, peer: SocketAddr);

    fn is_synced(&self, peer: SocketAddr) -> bool;

    /// Record the peer's platform id. Returns false if one was already known.
    fn record_platform_id(&self, peer: SocketAddr, id: &str) -> bool;

    /// Drop every piece of state held for `peer`.
    fn purge_peer(&self, peer: SocketAddr);

    /// All known peers with their synced flag.
    fn known_peers(&self) -> HashMap<SocketAddr, bool>;

    /// Names of the agents hosted by this platform.
    fn local_agent_names(&self) -> Vec<String>;

    /// Agent names currently recorded for `peer`.
    fn peer_agent_names(&self, peer: SocketAddr) -> BTreeSet<String>;
}

/// Local (in-process) message delivery.
pub trait LocalDelivery: Send + Sync + 'static {
    /// Deliver to the recipient named in the message.
    fn deliver_local(&self, msg: Message);

    /// Deliver to every local agent.
    fn deliver_broadcast(&self, msg: Message);

    /// Deliver to every local agent playing `role`.
    fn deliver_role_cast(&self, msg: Message, role: &str);
}

/// Receiver of network notifications.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: NetworkEvent);
}

/// The collaborators a [`crate::NetworkNode`] is constructed with.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn Directory>,
    pub delivery: Arc<dyn LocalDelivery>,
    pub events: Arc<dyn EventSink>,
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory collaborators for unit tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Default)]
    pub struct PeerState {
        pub synced: bool,
        pub platform_id: Option<String>,
        pub names: BTreeSet<String>,
    }

    #[derive(Default)]
    pub struct FakeDirectory {
        pub peers: Mutex<HashMap<SocketAddr, PeerState>>,
        pub local: Mutex<Vec<String>>,
        pub purged: Mutex<Vec<SocketAddr>>,
    }

    impl FakeDirectory {
        pub fn with_local(names: &[&str]) -> Self {
            let dir = Self::default();
            *dir.local.lock().unwrap() = names.iter().map(|s| s.to_string()).collect();
            dir
        }

        pub fn seed(&self, peer: SocketAddr, synced: bool, names: &[&str]) {
            self.peers.lock().unwrap().insert(
                peer,
                PeerState {
                    synced,
                    platform_id: None,
                    names: names.iter().map(|s| s.to_string()).collect(),
                },
            );
        }

        pub fn platform_id(&self, peer: SocketAddr) -> Option<String> {
            self.peers
                .lock()
                .unwrap()
                .get(&peer)
                .and_then(|p| p.platform_id.clone())
        }
    }

    impl Directory for FakeDirectory {
        fn add_remote_agent_name(&self, name: &str, peer: SocketAddr) -> bool {
            self.peers
                .lock()
                .unwrap()
                .entry(peer)
                .or_default()
                .names
                .insert(name.to_string())
        }

        fn remove_remote_agent_name(&self, name: &str, peer: SocketAddr) -> bool {
            self.peers
                .lock()
                .unwrap()
                .get_mut(&peer)
                .map(|p| p.names.remove(name))
                .unwrap_or(false)
        }

        fn is_peer_known(&self, peer: SocketAddr) -> bool {
            self.peers.lock().unwrap().contains_key(&peer)
        }

        fn ensure_peer(&self, peer: SocketAddr) {
            self.peers.lock().unwrap().entry(peer).or_default();
        }

        fn mark_synced(&self, peer: SocketAddr) {
            if let Some(p) = self.peers.lock().unwrap().get_mut(&peer) {
                p.synced = true;
            }
        }

        fn is_synced(&self, peer: SocketAddr) -> bool {
            self.peers
                .lock()
                .unwrap()
                .get(&peer)
                .map(|p| p.synced)
                .unwrap_or(false)
        }

        fn record_platform_id(&self, peer: SocketAddr, id: &str) -> bool {
            let mut peers = self.peers.lock().unwrap();
            let entry = peers.entry(peer).or_default();
            if entry.platform_id.is_some() {
                return false;
            }
            entry.platform_id = Some(id.to_string());
            true
        }

        fn purge_peer(&self, peer: SocketAddr) {
            self.peers.lock().unwrap().remove(&peer);
            self.purged.lock().unwrap().push(peer);
        }

        fn known_peers(&self) -> HashMap<SocketAddr, bool> {
            self.peers
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (*k, v.synced))
                .collect()
        }

        fn local_agent_names(&self) -> Vec<String> {
            self.local.lock().unwrap().clone()
        }

        fn peer_agent_names(&self, peer: SocketAddr) -> BTreeSet<String> {
            self.peers
                .lock()
                .unwrap()
                .get(&peer)
                .map(|p| p.names.clone())
                .unwrap_or_default()
        }
    }

    #[derive(Default)]
    pub struct RecordingEvents {
        pub events: Mutex<Vec<NetworkEvent>>,
    }

    impl RecordingEvents {
        pub fn snapshot(&self) -> Vec<NetworkEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn count(&self, name: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.name() == name)
                .count()
        }
    }

    impl EventSink for RecordingEvents {
        fn publish(&self, event: NetworkEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    pub enum Delivered {
        Local(Message),
        Broadcast(Message),
        Role(Message, String),
    }

    #[derive(Default)]
    pub struct RecordingDelivery {
        pub delivered: Mutex<Vec<Delivered>>,
    }

    impl RecordingDelivery {
        pub fn snapshot(&self) -> Vec<Delivered> {
            self.delivered.lock().unwrap().clone()
        }
    }

    impl LocalDelivery for RecordingDelivery {
        fn deliver_local(&self, msg: Message) {
            self.delivered.lock().unwrap().push(Delivered::Local(msg));
        }

        fn deliver_broadcast(&self, msg: Message) {
            self.delivered.lock().unwrap().push(Delivered::Broadcast(msg));
        }

        fn deliver_role_cast(&self, msg: Message, role: &str) {
            self.delivered
                .lock()
                .unwrap()
                .push(Delivered::Role(msg, role.to_string()));
        }
    }
}
