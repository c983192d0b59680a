//! Heartbeat failure detector: evicts links whose peer stopped answering.
//!
//! Every interval the detector queues a `heartbeat-request` carrying the
//! connection key on each open link, over the normal outbound path. The
//! remote echoes the key back in a `heartbeat-response`. A connection only
//! gets a record once its peer has finished directory sync, so slow
//! handshakes never look like failures. The first cycle after sync starts
//! the clock, so a peer that never answers is still evicted. A record older than
//! `tolerance_factor × interval` evicts its connection, which unregisters it
//! and purges the peer's directory state.

use crate::collaborators::Directory;
use crate::dispatcher::{Dispatcher, Route};
use crate::registry::ConnectionRegistry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use peerlink_types::config::{
    NetworkConfig, DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_HEARTBEAT_MULTIPLIER,
};
use peerlink_types::message::{keys, Message, Process};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Detector timing. Read once when the detector is built; changing the
/// configuration afterwards needs a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatSettings {
    pub interval: Duration,
    pub tolerance_factor: u32,
}

impl HeartbeatSettings {
    /// Silence after which a connection is evicted.
    pub fn timeout(&self) -> Duration {
        self.interval
            .checked_mul(self.tolerance_factor)
            .unwrap_or(Duration::MAX)
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            tolerance_factor: DEFAULT_HEARTBEAT_MULTIPLIER,
        }
    }
}

impl From<&NetworkConfig> for HeartbeatSettings {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            interval: config.heartbeat_interval(),
            tolerance_factor: config.heartbeat_timeout_multiplier.max(1),
        }
    }
}

/// Liveness of one tracked connection.
#[derive(Debug, Clone)]
pub struct HeartbeatStatus {
    pub connection_key: String,
    pub last_response: DateTime<Utc>,
    /// Milliseconds since the last response.
    pub silent_ms: i64,
    /// Whether the connection is still registered.
    pub registered: bool,
    pub stale: bool,
}

/// Build a probe for the connection identified by `key`.
pub fn heartbeat_request(key: &str) -> Message {
    Message::with_process(Process::HeartbeatRequest).with(keys::HEARTBEAT_KEY, key)
}

/// The answer to a probe, echoing its key. `None` when the probe has no key.
pub fn heartbeat_response(request: &Message) -> Option<Message> {
    let key = request.get_str(keys::HEARTBEAT_KEY)?;
    Some(Message::with_process(Process::HeartbeatResponse).with(keys::HEARTBEAT_KEY, key))
}

pub struct HeartbeatDetector {
    settings: HeartbeatSettings,
    /// Connection key -> last response.
    records: DashMap<String, DateTime<Utc>>,
    registry: ConnectionRegistry,
    directory: Arc<dyn Directory>,
}

impl HeartbeatDetector {
    pub fn new(
        settings: HeartbeatSettings,
        registry: ConnectionRegistry,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            settings,
            records: DashMap::new(),
            registry,
            directory,
        }
    }

    pub fn settings(&self) -> HeartbeatSettings {
        self.settings
    }

    /// Note a response on `key` from the platform at `peer`.
    ///
    /// Ignored until that peer is synced. Returns whether a record was
    /// created or refreshed.
    pub fn record_response(&self, key: &str, peer: Option<SocketAddr>) -> bool {
        self.record_response_at(key, peer, Utc::now())
    }

    pub fn record_response_at(
        &self,
        key: &str,
        peer: Option<SocketAddr>,
        at: DateTime<Utc>,
    ) -> bool {
        let synced = peer.map(|p| self.directory.is_synced(p)).unwrap_or(false);
        if !synced {
            debug!(key = %key, "Heartbeat response before sync, not tracked");
            return false;
        }
        self.records.insert(key.to_string(), at);
        true
    }

    pub fn last_response(&self, key: &str) -> Option<DateTime<Utc>> {
        self.records.get(key).map(|r| *r.value())
    }

    pub fn tracked(&self) -> usize {
        self.records.len()
    }

    /// Status of every record as of `now`. Pure: changes nothing.
    pub fn check(&self, now: DateTime<Utc>) -> Vec<HeartbeatStatus> {
        let timeout_ms = i64::try_from(self.settings.timeout().as_millis()).unwrap_or(i64::MAX);
        self.records
            .iter()
            .map(|r| {
                let silent_ms = (now - *r.value()).num_milliseconds();
                HeartbeatStatus {
                    connection_key: r.key().clone(),
                    last_response: *r.value(),
                    silent_ms,
                    registered: self.registry.contains_key(r.key()),
                    stale: silent_ms >= timeout_ms,
                }
            })
            .collect()
    }

    /// Drop records of departed connections and evict stale ones.
    /// Returns the keys of the evicted connections.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut evicted = Vec::new();
        for status in self.check(now) {
            if !status.registered {
                self.records.remove(&status.connection_key);
                continue;
            }
            if !status.stale {
                continue;
            }
            self.records.remove(&status.connection_key);
            if let Some(conn) = self.registry.get(&status.connection_key) {
                warn!(
                    key = %status.connection_key,
                    silent_ms = status.silent_ms,
                    "Peer stopped answering heartbeats, evicting"
                );
                self.registry.evict(conn.identity());
                evicted.push(status.connection_key);
            }
        }
        evicted
    }

    /// Start tracking open links to synced peers that have no record yet.
    /// Returns how many records were created.
    pub fn seed_synced(&self, now: DateTime<Utc>) -> usize {
        let mut seeded = 0;
        for conn in self.registry.connections() {
            if !conn.is_open() {
                continue;
            }
            let Some(peer) = conn.peer_address() else {
                continue;
            };
            if !self.directory.is_synced(peer) {
                continue;
            }
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.records.entry(conn.key()) {
                slot.insert(now);
                seeded += 1;
            }
        }
        seeded
    }

    /// One detector cycle: seed new records, probe every open link, then sweep.
    pub fn cycle(&self, dispatcher: &Dispatcher) -> Vec<String> {
        let seeded = self.seed_synced(Utc::now());
        if seeded > 0 {
            debug!(seeded, "Heartbeat tracking started for synced links");
        }
        for conn in self.registry.connections() {
            if !conn.is_open() {
                continue;
            }
            let key = conn.key();
            if let Err(e) = dispatcher.enqueue(heartbeat_request(&key), Route::Connection(key.clone())) {
                debug!(key = %key, error = %e, "Heartbeat probe not queued");
            }
        }
        self.sweep(Utc::now())
    }

    /// Run cycles every interval until `stop` flips.
    pub fn spawn(
        self: Arc<Self>,
        dispatcher: Arc<Dispatcher>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_ms = self.settings.interval.as_millis() as u64,
                tolerance = self.settings.tolerance_factor,
                "Heartbeat detector started"
            );
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so links get a full interval.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.cycle(&dispatcher);
                        if !evicted.is_empty() {
                            info!(count = evicted.len(), "Heartbeat sweep evicted connections");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("Heartbeat detector stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::{FakeDirectory, RecordingEvents};
    use crate::connection::{Connection, Direction};
    use crate::identity::ConnectionIdentity;

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn setup() -> (HeartbeatDetector, ConnectionRegistry, Arc<FakeDirectory>, Arc<Connection>) {
        let dir = Arc::new(FakeDirectory::default());
        let registry = ConnectionRegistry::new(dir.clone(), Arc::new(RecordingEvents::default()));
        let (conn, _io) = Connection::new(
            ConnectionIdentity::new("127.0.0.1", 9000, "127.0.0.1", 50000),
            Direction::Outbound,
        );
        conn.mark_open();
        registry.register(Arc::clone(&conn));
        let detector = HeartbeatDetector::new(
            HeartbeatSettings {
                interval: Duration::from_secs(5),
                tolerance_factor: 3,
            },
            registry.clone(),
            dir.clone(),
        );
        (detector, registry, dir, conn)
    }

    #[test]
    fn test_defaults() {
        let s = HeartbeatSettings::default();
        assert_eq!(s.interval, Duration::from_secs(5));
        assert_eq!(s.tolerance_factor, 3);
        assert_eq!(s.timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_not_tracked_before_sync() {
        let (detector, _registry, dir, conn) = setup();
        dir.seed(peer(), false, &[]);
        assert!(!detector.record_response(&conn.key(), Some(peer())));
        assert!(!detector.record_response(&conn.key(), None));
        assert_eq!(detector.tracked(), 0);

        dir.seed(peer(), true, &[]);
        assert!(detector.record_response(&conn.key(), Some(peer())));
        assert_eq!(detector.tracked(), 1);
    }

    #[test]
    fn test_stale_record_evicts_connection() {
        let (detector, registry, dir, conn) = setup();
        dir.seed(peer(), true, &["agentA"]);
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(5 * (3 + 1));
        detector.record_response_at(&conn.key(), Some(peer()), old);

        let evicted = detector.sweep(now);
        assert_eq!(evicted, vec![conn.key()]);
        assert!(registry.is_empty());
        assert!(conn.close_requested());
        assert!(!dir.is_peer_known(peer()));
        assert_eq!(detector.tracked(), 0);
    }

    #[test]
    fn test_silent_synced_peer_is_evicted() {
        let (detector, registry, dir, conn) = setup();
        conn.set_peer_address(peer());
        let now = Utc::now();

        // Not synced yet: no clock.
        dir.seed(peer(), false, &[]);
        assert_eq!(detector.seed_synced(now), 0);

        dir.seed(peer(), true, &[]);
        assert_eq!(detector.seed_synced(now), 1);
        // An existing record is never reset.
        assert_eq!(detector.seed_synced(now + chrono::Duration::seconds(10)), 0);
        assert_eq!(detector.last_response(&conn.key()), Some(now));

        assert!(detector.sweep(now + chrono::Duration::seconds(14)).is_empty());
        assert_eq!(detector.sweep(now + chrono::Duration::seconds(15)), vec![conn.key()]);
        assert!(registry.is_empty());
        assert!(conn.close_requested());
    }

    #[test]
    fn test_huge_interval_does_not_overflow() {
        let settings = HeartbeatSettings {
            interval: Duration::from_secs(u64::MAX / 2),
            tolerance_factor: 3,
        };
        assert_eq!(settings.timeout(), Duration::MAX);

        let (_, registry, dir, conn) = setup();
        let detector = HeartbeatDetector::new(settings, registry.clone(), dir.clone());
        dir.seed(peer(), true, &[]);
        let long_ago = Utc::now() - chrono::Duration::days(365 * 100);
        detector.record_response_at(&conn.key(), Some(peer()), long_ago);
        assert!(!detector.check(Utc::now())[0].stale);
        assert!(detector.sweep(Utc::now()).is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_fresh_record_survives() {
        let (detector, registry, dir, conn) = setup();
        dir.seed(peer(), true, &[]);
        let now = Utc::now();
        detector.record_response_at(&conn.key(), Some(peer()), now);
        assert!(detector.sweep(now).is_empty());
        assert_eq!(registry.len(), 1);
        assert_eq!(detector.last_response(&conn.key()), Some(now));
    }

    #[test]
    fn test_departed_connection_record_dropped() {
        let (detector, registry, dir, conn) = setup();
        dir.seed(peer(), true, &[]);
        detector.record_response(&conn.key(), Some(peer()));
        registry.unregister(conn.identity());

        let statuses = detector.check(Utc::now());
        assert!(!statuses[0].registered);
        assert!(detector.sweep(Utc::now()).is_empty());
        assert_eq!(detector.tracked(), 0);
    }

    #[test]
    fn test_probe_and_response_messages() {
        let req = heartbeat_request("a:1/b:2");
        assert_eq!(req.process(), Some(Process::HeartbeatRequest));
        let resp = heartbeat_response(&req).unwrap();
        assert_eq!(resp.process(), Some(Process::HeartbeatResponse));
        assert_eq!(resp.get_str(keys::HEARTBEAT_KEY), Some("a:1/b:2"));
        assert!(heartbeat_response(&Message::with_process(Process::HeartbeatRequest)).is_none());
    }
}
