//! Agent directory: which agents live here and on each known peer.
//!
//! [`MemoryDirectory`] keeps one [`PeerDirectoryEntry`] per peer listening
//! address plus the set of locally hosted agents. Nothing is persisted; a
//! restart starts from an empty view and resyncs.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use peerlink_wire::Directory;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::RwLock;
use tracing::debug;

/// What this platform knows about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDirectoryEntry {
    pub peer_address: SocketAddr,
    /// Set once, from the first `platform-id` entry received.
    pub platform_id: Option<String>,
    /// Both sides have exchanged a full directory.
    pub synced: bool,
    pub agent_names: BTreeSet<String>,
    pub first_seen: DateTime<Utc>,
}

impl PeerDirectoryEntry {
    fn new(peer_address: SocketAddr) -> Self {
        Self {
            peer_address,
            platform_id: None,
            synced: false,
            agent_names: BTreeSet::new(),
            first_seen: Utc::now(),
        }
    }
}

/// Thread-safe in-memory directory.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    peers: DashMap<SocketAddr, PeerDirectoryEntry>,
    local: RwLock<BTreeSet<String>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a locally hosted agent. Returns false if it already existed.
    pub fn add_local_agent(&self, name: &str) -> bool {
        self.local
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string())
    }

    /// Forget a locally hosted agent. Returns false if it was unknown.
    pub fn remove_local_agent(&self, name: &str) -> bool {
        self.local
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    pub fn has_local_agent(&self, name: &str) -> bool {
        self.local
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    /// Snapshot of one peer's entry.
    pub fn peer(&self, peer: SocketAddr) -> Option<PeerDirectoryEntry> {
        self.peers.get(&peer).map(|e| e.value().clone())
    }

    /// Snapshot of every peer entry.
    pub fn peers(&self) -> Vec<PeerDirectoryEntry> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    /// Peers currently advertising an agent with this name.
    pub fn locate_agent(&self, name: &str) -> Vec<SocketAddr> {
        let mut found: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|e| e.value().agent_names.contains(name))
            .map(|e| *e.key())
            .collect();
        found.sort();
        found
    }
}

impl Directory for MemoryDirectory {
    fn add_remote_agent_name(&self, name: &str, peer: SocketAddr) -> bool {
        self.peers
            .entry(peer)
            .or_insert_with(|| PeerDirectoryEntry::new(peer))
            .agent_names
            .insert(name.to_string())
    }

    fn remove_remote_agent_name(&self, name: &str, peer: SocketAddr) -> bool {
        self.peers
            .get_mut(&peer)
            .map(|mut e| e.agent_names.remove(name))
            .unwrap_or(false)
    }

    fn is_peer_known(&self, peer: SocketAddr) -> bool {
        self.peers.contains_key(&peer)
    }

    fn ensure_peer(&self, peer: SocketAddr) {
        self.peers
            .entry(peer)
            .or_insert_with(|| PeerDirectoryEntry::new(peer));
    }

    fn mark_synced(&self, peer: SocketAddr) {
        if let Some(mut entry) = self.peers.get_mut(&peer) {
            entry.synced = true;
        }
    }

    fn is_synced(&self, peer: SocketAddr) -> bool {
        self.peers.get(&peer).map(|e| e.synced).unwrap_or(false)
    }

    fn record_platform_id(&self, peer: SocketAddr, id: &str) -> bool {
        let mut entry = self
            .peers
            .entry(peer)
            .or_insert_with(|| PeerDirectoryEntry::new(peer));
        if entry.platform_id.is_some() {
            return false;
        }
        entry.platform_id = Some(id.to_string());
        true
    }

    fn purge_peer(&self, peer: SocketAddr) {
        if let Some((_, entry)) = self.peers.remove(&peer) {
            debug!(
                peer = %peer,
                agents = entry.agent_names.len(),
                "Purged peer directory entry"
            );
        }
    }

    fn known_peers(&self) -> HashMap<SocketAddr, bool> {
        self.peers
            .iter()
            .map(|e| (*e.key(), e.value().synced))
            .collect()
    }

    fn local_agent_names(&self) -> Vec<String> {
        self.local
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn peer_agent_names(&self, peer: SocketAddr) -> BTreeSet<String> {
        self.peers
            .get(&peer)
            .map(|e| e.agent_names.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_add_remove_remote_agents() {
        let dir = MemoryDirectory::new();
        assert!(dir.add_remote_agent_name("agentA", addr(1)));
        assert!(!dir.add_remote_agent_name("agentA", addr(1)));
        assert!(dir.is_peer_known(addr(1)));
        assert!(!dir.remove_remote_agent_name("agentA", addr(2)));
        assert!(dir.remove_remote_agent_name("agentA", addr(1)));
        assert!(dir.peer_agent_names(addr(1)).is_empty());
    }

    #[test]
    fn test_sync_flag_and_purge() {
        let dir = MemoryDirectory::new();
        dir.mark_synced(addr(1));
        assert!(!dir.is_peer_known(addr(1)));

        dir.ensure_peer(addr(1));
        assert!(!dir.is_synced(addr(1)));
        dir.mark_synced(addr(1));
        assert!(dir.is_synced(addr(1)));
        assert_eq!(dir.known_peers().get(&addr(1)), Some(&true));

        dir.purge_peer(addr(1));
        assert!(!dir.is_peer_known(addr(1)));
        assert!(dir.known_peers().is_empty());
    }

    #[test]
    fn test_platform_id_is_recorded_once() {
        let dir = MemoryDirectory::new();
        assert!(dir.record_platform_id(addr(1), "first"));
        assert!(!dir.record_platform_id(addr(1), "second"));
        assert_eq!(dir.peer(addr(1)).unwrap().platform_id.as_deref(), Some("first"));
    }

    #[test]
    fn test_local_agents_and_lookup() {
        let dir = MemoryDirectory::new();
        assert!(dir.add_local_agent("echo"));
        assert!(!dir.add_local_agent("echo"));
        assert!(dir.has_local_agent("echo"));
        assert_eq!(dir.local_agent_names(), vec!["echo"]);
        assert!(dir.remove_local_agent("echo"));
        assert!(dir.local_agent_names().is_empty());

        dir.add_remote_agent_name("planner", addr(2));
        dir.add_remote_agent_name("planner", addr(1));
        assert_eq!(dir.locate_agent("planner"), vec![addr(1), addr(2)]);
        assert_eq!(dir.peers().len(), 2);
    }
}
