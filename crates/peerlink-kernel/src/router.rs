//! Local router: hands inbound application messages to local agents.
//!
//! Each registered agent owns an unbounded mailbox. Roles are plain string
//! tags; an agent can play any number of them.

use dashmap::DashMap;
use peerlink_types::message::{keys, Message};
use peerlink_wire::LocalDelivery;
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Receiving side of an agent's mailbox.
pub type Mailbox = mpsc::UnboundedReceiver<Message>;

#[derive(Default)]
pub struct LocalRouter {
    mailboxes: DashMap<String, mpsc::UnboundedSender<Message>>,
    /// Agent name -> roles it plays.
    roles: DashMap<String, BTreeSet<String>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mailbox for `name`. `None` if the name is taken.
    pub fn register(&self, name: &str) -> Option<Mailbox> {
        if self.mailboxes.contains_key(name) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.insert(name.to_string(), tx);
        debug!(agent = %name, "Mailbox registered");
        Some(rx)
    }

    /// Drop the mailbox and roles of `name`. Returns false if it was unknown.
    pub fn unregister(&self, name: &str) -> bool {
        self.roles.remove(name);
        self.mailboxes.remove(name).is_some()
    }

    /// Give `name` a role. Returns false if the agent is not registered.
    pub fn assign_role(&self, name: &str, role: &str) -> bool {
        if !self.mailboxes.contains_key(name) {
            return false;
        }
        self.roles
            .entry(name.to_string())
            .or_default()
            .insert(role.to_string());
        true
    }

    pub fn revoke_role(&self, name: &str, role: &str) -> bool {
        self.roles
            .get_mut(name)
            .map(|mut r| r.remove(role))
            .unwrap_or(false)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.mailboxes.contains_key(name)
    }

    /// Registered agent names, sorted.
    pub fn agents(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mailboxes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Agents playing `role`, sorted.
    pub fn members_of(&self, role: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .roles
            .iter()
            .filter(|e| e.value().contains(role))
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Push into one mailbox. A closed mailbox is removed.
    fn push(&self, name: &str, msg: Message) -> bool {
        let Some(tx) = self.mailboxes.get(name).map(|t| t.value().clone()) else {
            return false;
        };
        if tx.send(msg).is_err() {
            debug!(agent = %name, "Mailbox closed, removing agent");
            self.unregister(name);
            return false;
        }
        true
    }
}

impl LocalDelivery for LocalRouter {
    fn deliver_local(&self, msg: Message) {
        let Some(name) = msg
            .get_str(keys::RECIPIENT)
            .or_else(|| msg.get_str(keys::TARGET))
            .map(str::to_string)
        else {
            warn!(message = %msg.summary(), "Message has no recipient, dropped");
            return;
        };
        if !self.push(&name, msg) {
            warn!(agent = %name, "No local agent with that name, message dropped");
        }
    }

    fn deliver_broadcast(&self, msg: Message) {
        for name in self.agents() {
            self.push(&name, msg.clone());
        }
    }

    fn deliver_role_cast(&self, msg: Message, role: &str) {
        let members = self.members_of(role);
        if members.is_empty() {
            debug!(role = %role, "Rolecast has no local members");
        }
        for name in members {
            self.push(&name, msg.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_types::message::Process;

    fn deliver_to(name: &str) -> Message {
        Message::with_process(Process::Deliver)
            .with(keys::RECIPIENT, name)
            .with("body", "hello")
    }

    #[test]
    fn test_register_twice_rejected() {
        let router = LocalRouter::new();
        assert!(router.register("echo").is_some());
        assert!(router.register("echo").is_none());
        assert!(router.unregister("echo"));
        assert!(!router.unregister("echo"));
    }

    #[test]
    fn test_deliver_by_recipient_and_target() {
        let router = LocalRouter::new();
        let mut rx = router.register("echo").unwrap();

        router.deliver_local(deliver_to("echo"));
        router.deliver_local(Message::with_process(Process::Deliver).with(keys::TARGET, "echo"));
        router.deliver_local(deliver_to("nobody"));
        router.deliver_local(Message::with_process(Process::Deliver));

        assert_eq!(rx.try_recv().unwrap().get_str("body"), Some("hello"));
        assert_eq!(rx.try_recv().unwrap().get_str(keys::TARGET), Some("echo"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_and_role_cast() {
        let router = LocalRouter::new();
        let mut a = router.register("a").unwrap();
        let mut b = router.register("b").unwrap();
        assert!(router.assign_role("b", "planner"));
        assert!(!router.assign_role("ghost", "planner"));

        router.deliver_broadcast(Message::with_process(Process::Broadcast));
        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_ok());

        router.deliver_role_cast(Message::with_process(Process::RoleCast), "planner");
        assert!(a.try_recv().is_err());
        assert!(b.try_recv().is_ok());

        assert!(router.revoke_role("b", "planner"));
        assert!(router.members_of("planner").is_empty());
    }

    #[test]
    fn test_closed_mailbox_is_removed() {
        let router = LocalRouter::new();
        drop(router.register("gone").unwrap());
        router.deliver_local(deliver_to("gone"));
        assert!(!router.is_registered("gone"));
    }
}
