//! Connection registry: the set of currently open links.
//!
//! The [`ConnectionRegistry`] is a concurrent map from connection key to
//! [`Connection`]. Registering a link publishes `PeerConnected`; removing it
//! publishes `PeerDisconnected` and purges the directory state held for the
//! peer behind it.

use crate::collaborators::{Directory, EventSink};
use crate::connection::Connection;
use crate::identity::ConnectionIdentity;
use dashmap::DashMap;
use peerlink_types::event::NetworkEvent;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Thread-safe registry of open connections.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, Arc<Connection>>>,
    /// Signalled after every removal.
    removed: Arc<Notify>,
    directory: Arc<dyn Directory>,
    events: Arc<dyn EventSink>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(directory: Arc<dyn Directory>, events: Arc<dyn EventSink>) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            removed: Arc::new(Notify::new()),
            directory,
            events,
        }
    }

    /// Insert a connection under its identity's key.
    ///
    /// Returns false (and publishes nothing) when a connection with the same
    /// identity is already registered.
    pub fn register(&self, conn: Arc<Connection>) -> bool {
        let key = conn.key();
        let address = conn.identity().remote_address();
        match self.connections.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                debug!(key = %e.key(), "Connection already registered");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                info!(key = %e.key(), direction = ?conn.direction(), "Connection registered");
                e.insert(conn);
                self.events.publish(NetworkEvent::PeerConnected { address });
                true
            }
        }
    }

    /// Remove the connection for `identity`.
    ///
    /// Takes a full [`ConnectionIdentity`] so that the directory purge always
    /// receives a well-formed peer address.
    pub fn unregister(&self, identity: &ConnectionIdentity) -> Option<Arc<Connection>> {
        let (key, conn) = self.connections.remove(&identity.key())?;
        conn.close();
        conn.mark_closed();

        let address = identity.remote_address();
        info!(key = %key, "Connection unregistered");
        self.events
            .publish(NetworkEvent::PeerDisconnected { address: address.clone() });

        match conn.peer_address().or_else(|| identity.remote_socket_addr()) {
            Some(peer) => self.directory.purge_peer(peer),
            None => warn!(key = %key, "Cannot resolve peer address, directory not purged"),
        }
        self.removed.notify_waiters();
        Some(conn)
    }

    /// Close a connection and remove it immediately.
    pub fn evict(&self, identity: &ConnectionIdentity) -> bool {
        if let Some(conn) = self.get(&identity.key()) {
            conn.close();
        }
        self.unregister(identity).is_some()
    }

    pub fn contains(&self, identity: &ConnectionIdentity) -> bool {
        self.connections.contains_key(&identity.key())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.connections.contains_key(key)
    }

    /// Get a connection by key.
    pub fn get(&self, key: &str) -> Option<Arc<Connection>> {
        self.connections.get(key).map(|e| Arc::clone(e.value()))
    }

    /// An open connection to the platform listening on `peer`.
    ///
    /// Outbound links are preferred over inbound ones when both exist.
    pub fn find_by_peer(&self, peer: SocketAddr) -> Option<Arc<Connection>> {
        let mut found: Option<Arc<Connection>> = None;
        for entry in self.connections.iter() {
            let conn = entry.value();
            if !conn.is_open() || conn.peer_address() != Some(peer) {
                continue;
            }
            if conn.direction() == crate::connection::Direction::Outbound {
                return Some(Arc::clone(conn));
            }
            found.get_or_insert_with(|| Arc::clone(conn));
        }
        found
    }

    /// Record the listening address of the platform behind an inbound link.
    pub fn bind_peer_address(&self, key: &str, peer: SocketAddr) {
        if let Some(conn) = self.connections.get(key) {
            if conn.peer_address() != Some(peer) {
                debug!(key = %key, peer = %peer, "Bound peer address");
                conn.set_peer_address(peer);
            }
        }
    }

    /// All registered connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Connections whose peer listens on `peer`.
    pub fn connections_to(&self, peer: SocketAddr) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|e| e.value().peer_address() == Some(peer))
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ask every connection to close.
    pub fn close_all(&self) {
        for conn in self.connections() {
            conn.close();
        }
    }

    /// Wait until every connection has been removed, up to `timeout`.
    ///
    /// Returns false when connections were still registered at the cutoff.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.removed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.connections.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::{FakeDirectory, RecordingEvents};
    use crate::connection::{ConnectionState, Direction};

    fn setup() -> (ConnectionRegistry, Arc<FakeDirectory>, Arc<RecordingEvents>) {
        let dir = Arc::new(FakeDirectory::default());
        let events = Arc::new(RecordingEvents::default());
        (
            ConnectionRegistry::new(dir.clone(), events.clone()),
            dir,
            events,
        )
    }

    fn outbound(port: u16) -> Arc<Connection> {
        let id = ConnectionIdentity::new("127.0.0.1", port, "127.0.0.1", 50000 + port);
        let (conn, _io) = Connection::new(id, Direction::Outbound);
        conn.mark_open();
        conn
    }

    #[test]
    fn test_register_fires_once() {
        let (registry, _dir, events) = setup();
        let conn = outbound(9000);
        assert!(registry.register(Arc::clone(&conn)));
        assert!(!registry.register(Arc::clone(&conn)));
        assert!(registry.contains(conn.identity()));
        assert_eq!(events.count("peer_connected"), 1);
        assert_eq!(
            events.snapshot()[0],
            NetworkEvent::PeerConnected {
                address: "127.0.0.1:9000".to_string()
            }
        );
    }

    #[test]
    fn test_unregister_purges_directory() {
        let (registry, dir, events) = setup();
        let conn = outbound(9000);
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        dir.seed(peer, true, &["agentA"]);
        registry.register(Arc::clone(&conn));

        let removed = registry.unregister(conn.identity()).unwrap();
        assert_eq!(removed.state(), ConnectionState::Closed);
        assert!(!registry.contains(conn.identity()));
        assert_eq!(events.count("peer_disconnected"), 1);
        assert_eq!(dir.purged.lock().unwrap().as_slice(), &[peer]);
        assert!(!dir.is_peer_known(peer));

        // Second removal is a no-op.
        assert!(registry.unregister(conn.identity()).is_none());
        assert_eq!(events.count("peer_disconnected"), 1);
    }

    #[test]
    fn test_find_by_peer_prefers_outbound() {
        let (registry, _dir, _events) = setup();
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        let inbound_id = ConnectionIdentity::new("127.0.0.1", 61000, "127.0.0.1", 4444);
        let (inbound, _io) = Connection::new(inbound_id, Direction::Inbound);
        inbound.mark_open();
        registry.register(Arc::clone(&inbound));
        assert!(registry.find_by_peer(peer).is_none());

        registry.bind_peer_address(&inbound.key(), peer);
        assert_eq!(registry.find_by_peer(peer).unwrap().key(), inbound.key());

        let out = outbound(9000);
        registry.register(Arc::clone(&out));
        assert_eq!(registry.find_by_peer(peer).unwrap().key(), out.key());
        assert_eq!(registry.connections_to(peer).len(), 2);
    }

    #[test]
    fn test_evict_closes() {
        let (registry, _dir, _events) = setup();
        let conn = outbound(9001);
        registry.register(Arc::clone(&conn));
        assert!(registry.evict(conn.identity()));
        assert!(conn.close_requested());
        assert!(registry.is_empty());
        assert!(!registry.evict(conn.identity()));
    }

    #[tokio::test]
    async fn test_wait_empty() {
        let (registry, _dir, _events) = setup();
        assert!(registry.wait_empty(Duration::from_millis(10)).await);
        let conn = outbound(9002);
        registry.register(Arc::clone(&conn));
        assert!(!registry.wait_empty(Duration::from_millis(50)).await);
    }
}
