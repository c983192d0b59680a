//! Platform assembly: boots the kernel services around a network node.

use crate::directory::MemoryDirectory;
use crate::error::{KernelError, KernelResult};
use crate::event_bus::EventBus;
use crate::router::{LocalRouter, Mailbox};
use crate::supervisor::Supervisor;
use peerlink_types::config::KernelConfig;
use peerlink_types::message::{keys, Message, Process};
use peerlink_wire::{Collaborators, LocalDelivery, NetworkNode};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// One running platform: local agents, their directory and the transport
/// that shares it with peers.
pub struct Platform {
    config: KernelConfig,
    events: Arc<EventBus>,
    directory: Arc<MemoryDirectory>,
    router: Arc<LocalRouter>,
    supervisor: Supervisor,
    node: Arc<NetworkNode>,
}

impl Platform {
    /// Boot the platform with the given configuration.
    pub async fn boot(config: KernelConfig) -> KernelResult<Self> {
        info!(node = %config.network.node_name, "Booting PeerLink platform");
        config.network.validate()?;

        let events = Arc::new(EventBus::new());
        let directory = Arc::new(MemoryDirectory::new());
        let router = Arc::new(LocalRouter::new());

        let node = NetworkNode::start(
            config.network.clone(),
            Collaborators {
                directory: directory.clone(),
                delivery: router.clone(),
                events: events.clone(),
            },
        )
        .await
        .map_err(|e| KernelError::BootFailed(format!("network node: {e}")))?;

        info!(
            address = %node.local_addr(),
            platform_id = %node.platform_id(),
            "Platform booted"
        );

        Ok(Self {
            config,
            events,
            directory,
            router,
            supervisor: Supervisor::new(),
            node,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn directory(&self) -> &Arc<MemoryDirectory> {
        &self.directory
    }

    pub fn router(&self) -> &Arc<LocalRouter> {
        &self.router
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn node(&self) -> &Arc<NetworkNode> {
        &self.node
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.node.local_addr()
    }

    /// Host a new agent and tell synced peers about it.
    pub fn register_agent(&self, name: &str) -> KernelResult<Mailbox> {
        let mailbox = self
            .router
            .register(name)
            .ok_or_else(|| KernelError::AgentExists(name.to_string()))?;
        self.directory.add_local_agent(name);
        let notified = self.node.announce_agents(&[name.to_string()], &[]);
        info!(agent = %name, peers = notified, "Agent registered");
        Ok(mailbox)
    }

    /// Stop hosting an agent and tell synced peers.
    pub fn unregister_agent(&self, name: &str) -> KernelResult<()> {
        if !self.router.unregister(name) {
            return Err(KernelError::AgentNotFound(name.to_string()));
        }
        self.directory.remove_local_agent(name);
        let notified = self.node.announce_agents(&[], &[name.to_string()]);
        info!(agent = %name, peers = notified, "Agent unregistered");
        Ok(())
    }

    pub fn assign_role(&self, name: &str, role: &str) -> KernelResult<()> {
        if self.router.assign_role(name, role) {
            Ok(())
        } else {
            Err(KernelError::AgentNotFound(name.to_string()))
        }
    }

    /// Dial `peer` and request a directory sync.
    pub fn connect(&self, peer: SocketAddr) -> KernelResult<()> {
        Ok(self.node.connect_to_peer(peer)?)
    }

    /// Queue a raw message for `peer`.
    pub fn send(&self, message: Message, peer: SocketAddr) -> KernelResult<()> {
        Ok(self.node.send(message, peer)?)
    }

    /// Deliver `message` to the agent called `name`, wherever it lives.
    ///
    /// Local agents win over remote ones. Among peers advertising the name,
    /// the lowest address is picked.
    pub fn send_to_agent(&self, name: &str, message: Message) -> KernelResult<()> {
        let mut message = message.with(keys::RECIPIENT, name);
        message.set_process(Process::Deliver);

        if self.router.is_registered(name) {
            self.router.deliver_local(message);
            return Ok(());
        }
        let Some(peer) = self.directory.locate_agent(name).into_iter().next() else {
            return Err(KernelError::AgentNotFound(name.to_string()));
        };
        self.send(message, peer)
    }

    /// Send `message` to every local agent and every synced peer.
    pub fn broadcast(&self, message: Message) -> usize {
        let mut message = message;
        message.set_process(Process::Broadcast);
        self.router.deliver_broadcast(message.clone());
        self.fan_out(message)
    }

    /// Send `message` to every agent playing `role`, here and on synced peers.
    pub fn role_cast(&self, role: &str, message: Message) -> usize {
        let mut message = message.with(keys::ROLE, role);
        message.set_process(Process::RoleCast);
        self.router.deliver_role_cast(message.clone(), role);
        self.fan_out(message)
    }

    fn fan_out(&self, message: Message) -> usize {
        let mut sent = 0;
        for peer in self.node.propagation().synced_peers() {
            match self.node.send(message.clone(), peer) {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = %peer, error = %e, "Fan-out not queued"),
            }
        }
        sent
    }

    /// Signal shutdown and stop the network node. Idempotent.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown();
        self.node.shutdown().await;
        info!("Platform stopped");
    }
}
