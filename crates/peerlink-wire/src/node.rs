//! The network node: one platform's transport, assembled.
//!
//! A [`NetworkNode`] owns the listener, the dispatcher, the connection
//! registry, the propagation state and the heartbeat detector, all built
//! around the collaborators it is given. Nodes are ordinary values: several
//! can run in one process, which is how the tests simulate a network.

use crate::acceptor::{Acceptor, AcceptorSettings};
use crate::backlog::OutboundBacklog;
use crate::codec::{codec_for, WireCodec};
use crate::collaborators::Collaborators;
use crate::connection::{Connection, ConnectionHandler, Direction};
use crate::dispatcher::{Dispatcher, DispatcherSettings, Route, SenderStamp};
use crate::error::{WireError, WireResult};
use crate::heartbeat::{heartbeat_response, HeartbeatDetector, HeartbeatSettings};
use crate::identity::join_host_port;
use crate::propagation::{Delivery, LocalNode, Propagation};
use crate::registry::ConnectionRegistry;
use peerlink_types::config::NetworkConfig;
use peerlink_types::message::{keys, Message, Process};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A running platform transport.
pub struct NetworkNode {
    config: NetworkConfig,
    platform_id: String,
    local_addr: SocketAddr,
    collaborators: Collaborators,
    registry: ConnectionRegistry,
    backlog: Arc<OutboundBacklog>,
    acceptor: Acceptor,
    dispatcher: Arc<Dispatcher>,
    propagation: Propagation,
    heartbeat: Option<Arc<HeartbeatDetector>>,
    stop_tx: watch::Sender<bool>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl NetworkNode {
    /// Bind the listener, start the background loops and dial the
    /// configured bootstrap peers.
    pub async fn start(config: NetworkConfig, collaborators: Collaborators) -> WireResult<Arc<Self>> {
        config.validate()?;
        let codec: Arc<dyn WireCodec> = codec_for(config.codec);
        let registry = ConnectionRegistry::new(
            Arc::clone(&collaborators.directory),
            Arc::clone(&collaborators.events),
        );

        let acceptor =
            Acceptor::bind(&AcceptorSettings::from(&config), collaborators.events.as_ref()).await?;
        let local_addr = acceptor.local_addr();

        let platform_id = config
            .platform_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", config.node_name, uuid::Uuid::new_v4()));
        let host = advertised_host(&config, local_addr);
        let location = join_host_port(&host, local_addr.port());

        let backlog = Arc::new(OutboundBacklog::new());
        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherSettings::from(&config),
            SenderStamp {
                address: host,
                port: local_addr.port(),
                platform_id: platform_id.clone(),
            },
            registry.clone(),
            Arc::clone(&codec),
            Arc::clone(&backlog),
        ));

        let propagation = Propagation::new(
            LocalNode {
                platform_id: platform_id.clone(),
                node_name: config.node_name.clone(),
                location: location.clone(),
            },
            config.disconnect_cooldown(),
            Arc::clone(&collaborators.directory),
            Arc::clone(&collaborators.events),
        );

        let heartbeat = config.heartbeat_enabled.then(|| {
            Arc::new(HeartbeatDetector::new(
                HeartbeatSettings::from(&config),
                registry.clone(),
                Arc::clone(&collaborators.directory),
            ))
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let node = Arc::new(Self {
            config,
            platform_id,
            local_addr,
            collaborators,
            registry,
            backlog,
            acceptor,
            dispatcher,
            propagation,
            heartbeat,
            stop_tx,
            heartbeat_task: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let handler: Arc<dyn ConnectionHandler> = node.clone();
        node.dispatcher.start(Arc::clone(&handler));
        node.acceptor.start(
            node.registry.clone(),
            codec,
            handler,
            Arc::clone(node.dispatcher.in_flight()),
        );
        if let Some(detector) = &node.heartbeat {
            let task = Arc::clone(detector).spawn(Arc::clone(&node.dispatcher), stop_rx);
            *node.heartbeat_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        }

        info!(
            address = %node.local_addr,
            platform_id = %node.platform_id,
            location = %location,
            codec = %node.config.codec,
            "Network node started"
        );

        for peer in &node.config.bootstrap_peers {
            match peer.parse::<SocketAddr>() {
                Ok(addr) => {
                    if let Err(e) = node.connect_to_peer(addr) {
                        warn!(peer = %addr, error = %e, "Bootstrap connect not queued");
                    }
                }
                Err(_) => warn!(peer = %peer, "Invalid bootstrap peer address, skipped"),
            }
        }

        Ok(node)
    }

    /// Actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn platform_id(&self) -> &str {
        &self.platform_id
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn backlog(&self) -> &Arc<OutboundBacklog> {
        &self.backlog
    }

    pub fn propagation(&self) -> &Propagation {
        &self.propagation
    }

    pub fn heartbeat(&self) -> Option<&Arc<HeartbeatDetector>> {
        self.heartbeat.as_ref()
    }

    /// Queue a message for the platform listening on `peer`.
    pub fn send(&self, message: Message, peer: SocketAddr) -> WireResult<()> {
        self.dispatcher.enqueue(message, Route::Peer(peer))
    }

    /// Forward a message received from another platform one more hop.
    ///
    /// Returns `Ok(false)` without sending when the message already passed
    /// through this node or has already been relayed once.
    pub fn relay(&self, message: Message, peer: SocketAddr) -> WireResult<bool> {
        let log = message.node_log();
        if log.contains(&self.platform_id) || log.len() > 1 {
            debug!(peer = %peer, hops = log.len(), "Relay refused");
            return Ok(false);
        }
        self.dispatcher.enqueue(message, Route::Peer(peer))?;
        Ok(true)
    }

    /// Open a link to `peer` (if needed) and request a directory resync.
    pub fn connect_to_peer(&self, peer: SocketAddr) -> WireResult<()> {
        info!(peer = %peer, "Connecting to peer");
        self.dispatcher
            .enqueue(self.propagation.initial_sync_message(), Route::Peer(peer))
    }

    /// Tell every synced peer about local agent changes. Returns the number
    /// of peers notified.
    pub fn announce_agents(&self, added: &[String], removed: &[String]) -> usize {
        let Some(diff) = self.propagation.announce(added, removed) else {
            return 0;
        };
        let mut notified = 0;
        for peer in self.propagation.synced_peers() {
            match self.dispatcher.enqueue(diff.clone(), Route::Peer(peer)) {
                Ok(()) => notified += 1,
                Err(e) => warn!(peer = %peer, error = %e, "Directory update not queued"),
            }
        }
        notified
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Announce shutdown to connected peers, then stop every loop and close
    /// every connection. Each wait is bounded. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(address = %self.local_addr, "Network node shutting down");

        let notice = self.propagation.shutdown_notice();
        for peer in self.collaborators.directory.known_peers().into_keys() {
            if self.registry.find_by_peer(peer).is_some() {
                if let Err(e) = self.dispatcher.enqueue(notice.clone(), Route::Peer(peer)) {
                    debug!(peer = %peer, error = %e, "Shutdown notice not queued");
                }
            }
        }

        let _ = self.stop_tx.send(true);
        let task = self
            .heartbeat_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.config.drain_timeout(), &mut task)
                .await
                .is_err()
            {
                warn!("Heartbeat detector did not stop in time, aborting");
                task.abort();
            }
        }

        self.acceptor.shutdown().await;
        self.dispatcher.shutdown().await;
        info!(address = %self.local_addr, "Network node stopped");
    }

    /// Route one inbound message.
    fn handle_inbound(&self, conn: &Arc<Connection>, msg: Message) {
        if msg.node_log().contains(&self.platform_id) {
            debug!(key = %conn.key(), message = %msg.summary(), "Message looped back, dropped");
            return;
        }

        let Some(peer) = self.resolve_peer(conn, &msg) else {
            warn!(key = %conn.key(), message = %msg.summary(), "Cannot determine peer address, dropped");
            return;
        };

        match msg.process() {
            Some(Process::HeartbeatRequest) => {
                if let Some(response) = heartbeat_response(&msg) {
                    self.reply(conn, response);
                }
            }
            Some(Process::HeartbeatResponse) => {
                if let Some(detector) = &self.heartbeat {
                    let echoed = msg.get_str(keys::HEARTBEAT_KEY).unwrap_or_default();
                    if echoed != conn.key() {
                        debug!(key = %conn.key(), echoed = %echoed, "Heartbeat key mismatch");
                    }
                    detector.record_response(&conn.key(), Some(peer));
                }
            }
            _ => {
                let outcome = self.propagation.handle_inbound(peer, msg);
                for reply in outcome.replies {
                    self.reply(conn, reply);
                }
                if let Some(delivery) = outcome.delivery {
                    self.deliver(delivery);
                }
                if outcome.close_peer {
                    for link in self.registry.connections_to(peer) {
                        link.close();
                    }
                    conn.close();
                }
            }
        }
    }

    /// Listening address of the platform behind `conn`, learning it from the
    /// `sender-port` stamp on inbound links.
    fn resolve_peer(&self, conn: &Arc<Connection>, msg: &Message) -> Option<SocketAddr> {
        if conn.direction() == Direction::Inbound {
            let port = msg
                .get(keys::SENDER_PORT)
                .and_then(|v| v.as_int())
                .and_then(|p| u16::try_from(p).ok());
            let ip = conn.identity().remote_socket_addr().map(|a| a.ip());
            if let (Some(ip), Some(port)) = (ip, port) {
                self.registry
                    .bind_peer_address(&conn.key(), SocketAddr::new(ip, port));
            }
        }
        conn.peer_address()
    }

    fn reply(&self, conn: &Arc<Connection>, msg: Message) {
        if let Err(e) = self.dispatcher.enqueue(msg, Route::Connection(conn.key())) {
            debug!(key = %conn.key(), error = %e, "Reply not queued");
        }
    }

    fn deliver(&self, delivery: Delivery) {
        let local = &self.collaborators.delivery;
        match delivery {
            Delivery::Local(msg) => local.deliver_local(msg),
            Delivery::Broadcast(msg) => local.deliver_broadcast(msg),
            Delivery::RoleCast(msg, role) => local.deliver_role_cast(msg, &role),
        }
    }
}

impl ConnectionHandler for NetworkNode {
    fn on_message(&self, conn: &Arc<Connection>, msg: Message) {
        self.handle_inbound(conn, msg);
    }

    fn on_closed(&self, conn: &Arc<Connection>, reason: Option<WireError>) {
        match &reason {
            Some(e) if e.is_protocol() => {
                warn!(key = %conn.key(), error = %e, "Connection closed after protocol error")
            }
            Some(e) => debug!(key = %conn.key(), error = %e, "Connection lost"),
            None => debug!(key = %conn.key(), "Connection closed"),
        }
        self.registry.unregister(conn.identity());
    }
}

fn advertised_host(config: &NetworkConfig, local_addr: SocketAddr) -> String {
    if let Some(host) = &config.advertised_host {
        return host.clone();
    }
    let ip = if local_addr.ip().is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        local_addr.ip()
    };
    ip.to_string()
}
