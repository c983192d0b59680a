//! Directory propagation state machine.
//!
//! Decides what to do with every inbound message. Management messages carry
//! directory diffs (`"<agent>": "add" | "remove"`, `"<id>": "platform-id"`)
//! plus a handful of protocol markers; everything else is application
//! traffic for local delivery.
//!
//! [`Propagation::handle_inbound`] does no I/O. It updates the directory,
//! publishes events and returns an [`Outcome`] listing the replies to send
//! back to the peer and the local delivery to perform.
//!
//! Two fresh peers bootstrap like this:
//!
//! ```text
//!   A                                   B
//!   | -- init {initialize-propagation} -> |  B purges A, replies full dir
//!   | <-------- full directory ---------- |  A learns B (unsynced), replies
//!   | --------- full directory ---------> |  B: A known+unsynced -> synced
//!   | <---------- location -------------- |  A: B known+unsynced -> synced
//!   | ----------- location -------------> |
//! ```

use crate::collaborators::{Directory, EventSink};
use dashmap::DashMap;
use peerlink_types::event::NetworkEvent;
use peerlink_types::message::{actions, keys, Message, Process};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where an inbound message should be delivered locally.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// To the recipient named in the message.
    Local(Message),
    /// To every local agent.
    Broadcast(Message),
    /// To every local agent playing the role.
    RoleCast(Message, String),
}

/// Result of processing one inbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Messages to send back to the same peer, in order.
    pub replies: Vec<Message>,
    pub delivery: Option<Delivery>,
    /// The peer announced shutdown; its links should be closed.
    pub close_peer: bool,
}

impl Outcome {
    fn deliver(delivery: Delivery) -> Self {
        Self {
            delivery: Some(delivery),
            ..Self::default()
        }
    }
}

/// Identity this node uses in propagation traffic.
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub platform_id: String,
    pub node_name: String,
    /// `host:port` peers should use to reach us.
    pub location: String,
}

/// The per-node propagation state.
pub struct Propagation {
    local: LocalNode,
    cooldown: Duration,
    /// Peers that announced shutdown, with the instant their block expires.
    blocked: DashMap<SocketAddr, Instant>,
    /// Declared node name -> peer address, recorded from resync requests.
    peer_names: DashMap<String, SocketAddr>,
    directory: Arc<dyn Directory>,
    events: Arc<dyn EventSink>,
}

impl Propagation {
    pub fn new(
        local: LocalNode,
        cooldown: Duration,
        directory: Arc<dyn Directory>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            local,
            cooldown,
            blocked: DashMap::new(),
            peer_names: DashMap::new(),
            directory,
            events,
        }
    }

    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    /// Process one message received from the platform listening on `peer`.
    pub fn handle_inbound(&self, peer: SocketAddr, mut msg: Message) -> Outcome {
        let Some(process) = msg.process() else {
            warn!(peer = %peer, message = %msg.summary(), "Message without a known process, dropped");
            return Outcome::default();
        };

        match process {
            Process::Management => self.handle_management(peer, msg),
            Process::Deliver => {
                tag_sender(&mut msg, peer);
                Outcome::deliver(Delivery::Local(msg))
            }
            Process::Broadcast | Process::RoleCast if carries_resolved_content(&msg) => {
                // Already resolved: deliver directly instead of fanning out again.
                tag_sender(&mut msg, peer);
                Outcome::deliver(Delivery::Local(msg))
            }
            Process::Broadcast => {
                tag_sender(&mut msg, peer);
                Outcome::deliver(Delivery::Broadcast(msg))
            }
            Process::RoleCast => {
                let Some(role) = msg.get_str(keys::ROLE).map(str::to_string) else {
                    warn!(peer = %peer, message = %msg.summary(), "Rolecast without role, dropped");
                    return Outcome::default();
                };
                tag_sender(&mut msg, peer);
                Outcome::deliver(Delivery::RoleCast(msg, role))
            }
            Process::HeartbeatRequest | Process::HeartbeatResponse => {
                debug!(peer = %peer, "Heartbeat traffic reached propagation, ignored");
                Outcome::default()
            }
        }
    }

    fn handle_management(&self, peer: SocketAddr, msg: Message) -> Outcome {
        let mut outcome = Outcome::default();

        if self.is_blocked(peer) {
            debug!(peer = %peer, "Peer is disconnecting, management message ignored");
            return outcome;
        }

        let was_known = self.directory.is_peer_known(peer);
        let init = msg
            .get_str(keys::INITIALIZE_PROPAGATION)
            .map(str::to_string);
        let shutting_down = msg.contains_key(keys::SHUTDOWN);

        if let Some(name) = &init {
            info!(peer = %peer, node = %name, "Resync requested");
            self.directory.purge_peer(peer);
            self.peer_names.insert(name.clone(), peer);
        }
        self.directory.ensure_peer(peer);

        let (added, removed) = self.apply_diff(peer, &msg);
        if added > 0 || removed > 0 {
            self.events.publish(NetworkEvent::DirectoryChanged {
                address: peer.to_string(),
                added,
                removed,
            });
        }

        if !shutting_down {
            if !was_known || init.is_some() {
                outcome.replies.push(self.full_directory_message());
            } else if !self.directory.is_synced(peer) {
                self.directory.mark_synced(peer);
                info!(peer = %peer, "Peer synchronized");
                self.events.publish(NetworkEvent::PeerSynchronized {
                    address: peer.to_string(),
                });
                outcome.replies.push(self.location_message());
            }
        }

        if let Some(location) = msg.get_str(keys::LOCATION) {
            self.events.publish(NetworkEvent::LocationReceived {
                address: peer.to_string(),
                location: location.to_string(),
            });
        }

        if carries_resolved_content(&msg) {
            let mut local = msg.clone();
            local.remove(keys::RECIPIENT);
            local.set_process(Process::Deliver);
            tag_sender(&mut local, peer);
            outcome.delivery = Some(Delivery::Local(local));
        }

        if shutting_down {
            self.block(peer);
            self.directory.purge_peer(peer);
            self.forget_names(peer);
            info!(peer = %peer, "Peer announced shutdown");
            self.events.publish(NetworkEvent::PeerShutdown {
                address: peer.to_string(),
            });
            outcome.close_peer = true;
        }

        outcome
    }

    /// Apply the directory entries of a management message, in arrival order.
    fn apply_diff(&self, peer: SocketAddr, msg: &Message) -> (usize, usize) {
        let mut added = 0;
        let mut removed = 0;
        for (key, value) in msg.iter() {
            if keys::is_reserved(key) {
                continue;
            }
            match value.as_str() {
                Some(actions::ADD) => {
                    if self.directory.add_remote_agent_name(key, peer) {
                        added += 1;
                    }
                }
                Some(actions::REMOVE) => {
                    if self.directory.remove_remote_agent_name(key, peer) {
                        removed += 1;
                    }
                }
                Some(actions::PLATFORM_ID) => {
                    if self.directory.record_platform_id(peer, key) {
                        debug!(peer = %peer, platform_id = %key, "Recorded platform id");
                    }
                }
                _ => debug!(peer = %peer, key = %key, "Ignoring non-directory entry"),
            }
        }
        (added, removed)
    }

    /// Whether management traffic from `peer` is currently ignored.
    /// Expired entries are dropped on lookup.
    pub fn is_blocked(&self, peer: SocketAddr) -> bool {
        let expired = match self.blocked.get(&peer) {
            Some(until) => Instant::now() >= *until,
            None => return false,
        };
        if expired {
            self.blocked.remove(&peer);
            return false;
        }
        true
    }

    fn block(&self, peer: SocketAddr) {
        self.blocked.insert(peer, Instant::now() + self.cooldown);
    }

    /// Address recorded for a node name from its resync request.
    pub fn peer_for_name(&self, name: &str) -> Option<SocketAddr> {
        self.peer_names.get(name).map(|e| *e.value())
    }

    /// Drop the name mappings pointing at `peer`.
    pub fn forget_names(&self, peer: SocketAddr) {
        self.peer_names.retain(|_, addr| *addr != peer);
    }

    /// Our full directory: platform id plus every local agent as `add`.
    pub fn full_directory_message(&self) -> Message {
        let mut msg = Message::with_process(Process::Management)
            .with(self.local.platform_id.as_str(), actions::PLATFORM_ID);
        for name in self.directory.local_agent_names() {
            msg.insert(name, actions::ADD);
        }
        msg
    }

    /// Resync request sent on a freshly opened link.
    pub fn initial_sync_message(&self) -> Message {
        let mut msg = Message::with_process(Process::Management)
            .with(keys::INITIALIZE_PROPAGATION, self.local.node_name.as_str());
        for (key, value) in self.full_directory_message().into_entries() {
            if key != keys::PROCESS {
                msg.insert(key, value);
            }
        }
        msg
    }

    /// One-time post-sync announcement of where we can be reached.
    pub fn location_message(&self) -> Message {
        Message::with_process(Process::Management).with(keys::LOCATION, self.local.location.as_str())
    }

    pub fn shutdown_notice(&self) -> Message {
        Message::with_process(Process::Management).with(keys::SHUTDOWN, true)
    }

    /// Diff announcing local agent changes, or `None` when nothing changed.
    pub fn announce(&self, added: &[String], removed: &[String]) -> Option<Message> {
        if added.is_empty() && removed.is_empty() {
            return None;
        }
        let mut msg = Message::with_process(Process::Management);
        for name in added {
            msg.insert(name.as_str(), actions::ADD);
        }
        for name in removed {
            msg.insert(name.as_str(), actions::REMOVE);
        }
        Some(msg)
    }

    /// Peers whose directory sync has completed.
    pub fn synced_peers(&self) -> BTreeSet<SocketAddr> {
        self.directory
            .known_peers()
            .into_iter()
            .filter_map(|(addr, synced)| synced.then_some(addr))
            .collect()
    }
}

fn carries_resolved_content(msg: &Message) -> bool {
    msg.contains_key(keys::EVENT) || msg.contains_key(keys::TARGET)
}

/// Overwrite the sender keys with the address we verified.
fn tag_sender(msg: &mut Message, peer: SocketAddr) {
    msg.insert(keys::SENDER_ADDRESS, peer.ip().to_string());
    msg.insert(keys::SENDER_PORT, peer.port());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::{FakeDirectory, RecordingEvents};

    fn peer() -> SocketAddr {
        "10.0.0.2:4444".parse().unwrap()
    }

    fn setup(cooldown: Duration) -> (Propagation, Arc<FakeDirectory>, Arc<RecordingEvents>) {
        let dir = Arc::new(FakeDirectory::with_local(&["echo", "planner"]));
        let events = Arc::new(RecordingEvents::default());
        let prop = Propagation::new(
            LocalNode {
                platform_id: "platform-local".into(),
                node_name: "Node-0".into(),
                location: "10.0.0.1:4444".into(),
            },
            cooldown,
            dir.clone(),
            events.clone(),
        );
        (prop, dir, events)
    }

    fn mgmt() -> Message {
        Message::with_process(Process::Management)
    }

    fn names(dir: &FakeDirectory) -> Vec<String> {
        dir.peer_agent_names(peer()).into_iter().collect()
    }

    #[test]
    fn test_incremental_diff() {
        let (prop, dir, events) = setup(Duration::from_secs(15));
        dir.seed(peer(), true, &["agentB", "agentC"]);

        let out = prop.handle_inbound(
            peer(),
            mgmt().with("agentA", actions::ADD).with("agentB", actions::REMOVE),
        );
        assert_eq!(names(&dir), vec!["agentA", "agentC"]);
        assert!(out.replies.is_empty());
        assert_eq!(
            events.snapshot(),
            vec![NetworkEvent::DirectoryChanged {
                address: peer().to_string(),
                added: 1,
                removed: 1
            }]
        );
    }

    #[test]
    fn test_init_request_purges_and_replies_full_directory() {
        let (prop, dir, _events) = setup(Duration::from_secs(15));
        dir.seed(peer(), true, &["stale"]);

        let out = prop.handle_inbound(
            peer(),
            mgmt()
                .with(keys::INITIALIZE_PROPAGATION, "Node-1")
                .with("remoteAgent", actions::ADD),
        );

        assert_eq!(dir.purged.lock().unwrap().as_slice(), &[peer()]);
        assert_eq!(names(&dir), vec!["remoteAgent"]);
        assert!(dir.is_peer_known(peer()));
        assert!(!dir.is_synced(peer()));
        assert_eq!(prop.peer_for_name("Node-1"), Some(peer()));

        assert_eq!(out.replies.len(), 1);
        let reply = &out.replies[0];
        assert_eq!(reply.process(), Some(Process::Management));
        assert!(!reply.contains_key(keys::INITIALIZE_PROPAGATION));
        assert_eq!(reply.get_str("echo"), Some(actions::ADD));
        assert_eq!(reply.get_str("planner"), Some(actions::ADD));
        assert_eq!(reply.get_str("platform-local"), Some(actions::PLATFORM_ID));
    }

    #[test]
    fn test_sync_completion_sends_location_once() {
        let (prop, dir, events) = setup(Duration::from_secs(15));
        prop.handle_inbound(peer(), mgmt().with(keys::INITIALIZE_PROPAGATION, "Node-1"));

        let out = prop.handle_inbound(peer(), mgmt().with("agentX", actions::ADD));
        assert!(dir.is_synced(peer()));
        assert_eq!(events.count("peer_synchronized"), 1);
        assert_eq!(out.replies.len(), 1);
        assert_eq!(out.replies[0].get_str(keys::LOCATION), Some("10.0.0.1:4444"));

        let again = prop.handle_inbound(peer(), mgmt().with("agentY", actions::ADD));
        assert!(again.replies.is_empty());
        assert_eq!(events.count("peer_synchronized"), 1);
    }

    #[test]
    fn test_unknown_peer_gets_full_directory() {
        let (prop, dir, events) = setup(Duration::from_secs(15));
        let out = prop.handle_inbound(peer(), mgmt().with("agentA", actions::ADD));
        assert!(dir.is_peer_known(peer()));
        assert!(!dir.is_synced(peer()));
        assert_eq!(out.replies.len(), 1);
        assert_eq!(out.replies[0].get_str("echo"), Some(actions::ADD));
        assert_eq!(events.count("directory_changed"), 1);
        assert_eq!(events.count("peer_synchronized"), 0);
    }

    #[test]
    fn test_platform_id_recorded_once() {
        let (prop, dir, _events) = setup(Duration::from_secs(15));
        dir.seed(peer(), true, &[]);
        prop.handle_inbound(peer(), mgmt().with("id-1", actions::PLATFORM_ID));
        prop.handle_inbound(peer(), mgmt().with("id-2", actions::PLATFORM_ID));
        assert_eq!(dir.platform_id(peer()).as_deref(), Some("id-1"));
    }

    #[test]
    fn test_no_event_without_changes() {
        let (prop, dir, events) = setup(Duration::from_secs(15));
        dir.seed(peer(), true, &["agentA"]);
        prop.handle_inbound(
            peer(),
            mgmt().with("agentA", actions::ADD).with("ghost", actions::REMOVE),
        );
        assert_eq!(events.count("directory_changed"), 0);
    }

    #[test]
    fn test_shutdown_blocks_until_cooldown_expires() {
        let (prop, dir, events) = setup(Duration::from_millis(50));
        dir.seed(peer(), true, &["agentA"]);
        prop.handle_inbound(peer(), mgmt().with(keys::INITIALIZE_PROPAGATION, "Node-1"));

        let out = prop.handle_inbound(peer(), mgmt().with(keys::SHUTDOWN, true));
        assert!(out.close_peer);
        assert!(out.replies.is_empty());
        assert!(!dir.is_peer_known(peer()));
        assert!(prop.is_blocked(peer()));
        assert_eq!(prop.peer_for_name("Node-1"), None);
        assert_eq!(events.count("peer_shutdown"), 1);

        let ignored = prop.handle_inbound(peer(), mgmt().with("agentZ", actions::ADD));
        assert_eq!(ignored, Outcome::default());
        assert!(!dir.is_peer_known(peer()));

        std::thread::sleep(Duration::from_millis(60));
        assert!(!prop.is_blocked(peer()));
        let out = prop.handle_inbound(peer(), mgmt().with("agentZ", actions::ADD));
        assert!(dir.is_peer_known(peer()));
        assert_eq!(out.replies.len(), 1);
    }

    #[test]
    fn test_piggybacked_event_is_delivered_locally() {
        let (prop, dir, events) = setup(Duration::from_secs(15));
        dir.seed(peer(), true, &[]);
        let out = prop.handle_inbound(
            peer(),
            mgmt()
                .with(keys::EVENT, "location-changed")
                .with(keys::RECIPIENT, "ams")
                .with(keys::LOCATION, "10.0.0.2:4444"),
        );
        let Some(Delivery::Local(delivered)) = out.delivery else {
            panic!("expected local delivery");
        };
        assert_eq!(delivered.process(), Some(Process::Deliver));
        assert!(!delivered.contains_key(keys::RECIPIENT));
        assert_eq!(delivered.get_str(keys::SENDER_ADDRESS), Some("10.0.0.2"));
        assert_eq!(events.count("location_received"), 1);
    }

    #[test]
    fn test_application_processes() {
        let (prop, _dir, _events) = setup(Duration::from_secs(15));

        let out = prop.handle_inbound(
            peer(),
            Message::with_process(Process::Deliver).with(keys::RECIPIENT, "echo"),
        );
        let Some(Delivery::Local(msg)) = out.delivery else {
            panic!("expected local delivery");
        };
        assert_eq!(msg.get(keys::SENDER_PORT).and_then(|v| v.as_int()), Some(4444));

        let out = prop.handle_inbound(peer(), Message::with_process(Process::Broadcast));
        assert!(matches!(out.delivery, Some(Delivery::Broadcast(_))));

        let out = prop.handle_inbound(
            peer(),
            Message::with_process(Process::Broadcast).with(keys::TARGET, "echo"),
        );
        assert!(matches!(out.delivery, Some(Delivery::Local(_))));

        let out = prop.handle_inbound(
            peer(),
            Message::with_process(Process::RoleCast).with(keys::ROLE, "worker"),
        );
        assert!(matches!(out.delivery, Some(Delivery::RoleCast(_, ref r)) if r == "worker"));

        let out = prop.handle_inbound(
            peer(),
            Message::with_process(Process::RoleCast).with(keys::EVENT, "x"),
        );
        assert!(matches!(out.delivery, Some(Delivery::Local(_))));

        let out = prop.handle_inbound(peer(), Message::with_process(Process::RoleCast));
        assert!(out.delivery.is_none());

        let out = prop.handle_inbound(peer(), Message::new().with("no", "process"));
        assert_eq!(out, Outcome::default());
    }

    #[test]
    fn test_outbound_builders() {
        let (prop, dir, _events) = setup(Duration::from_secs(15));
        let init = prop.initial_sync_message();
        assert_eq!(init.get_str(keys::INITIALIZE_PROPAGATION), Some("Node-0"));
        assert_eq!(init.get_str("echo"), Some(actions::ADD));
        assert_eq!(init.process(), Some(Process::Management));

        assert!(prop.shutdown_notice().contains_key(keys::SHUTDOWN));
        assert!(prop.announce(&[], &[]).is_none());
        let diff = prop
            .announce(&["new".to_string()], &["old".to_string()])
            .unwrap();
        assert_eq!(diff.get_str("new"), Some(actions::ADD));
        assert_eq!(diff.get_str("old"), Some(actions::REMOVE));

        let other: SocketAddr = "10.0.0.3:4444".parse().unwrap();
        dir.seed(peer(), true, &[]);
        dir.seed(other, false, &[]);
        assert_eq!(prop.synced_peers().into_iter().collect::<Vec<_>>(), vec![peer()]);
    }
}
