//! Outbound backlog: messages that could not be delivered.
//!
//! The dispatcher never resends. When a destination cannot be reached the
//! message is parked here together with the reason, so nothing disappears
//! without a trace. Entries are only removed by an explicit [`OutboundBacklog::drain`].

use chrono::{DateTime, Utc};
use peerlink_types::message::Message;
use std::sync::Mutex;
use tracing::warn;

/// A message the dispatcher gave up on.
#[derive(Debug, Clone)]
pub struct UnsentMessage {
    pub message: Message,
    /// Where it was headed (peer address or connection key).
    pub destination: String,
    /// Why it was not sent.
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only store of unsent messages.
#[derive(Debug, Default)]
pub struct OutboundBacklog {
    entries: Mutex<Vec<UnsentMessage>>,
}

impl OutboundBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an undeliverable message.
    pub fn record(&self, message: Message, destination: impl Into<String>, reason: impl Into<String>) {
        let entry = UnsentMessage {
            destination: destination.into(),
            reason: reason.into(),
            recorded_at: Utc::now(),
            message,
        };
        warn!(
            destination = %entry.destination,
            reason = %entry.reason,
            message = %entry.message.summary(),
            "Message moved to outbound backlog"
        );
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry, oldest first.
    pub fn snapshot(&self) -> Vec<UnsentMessage> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Entries recorded for one destination.
    pub fn for_destination(&self, destination: &str) -> Vec<UnsentMessage> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.destination == destination)
            .cloned()
            .collect()
    }

    /// Take every entry out of the backlog.
    pub fn drain(&self) -> Vec<UnsentMessage> {
        std::mem::take(&mut *self.entries.lock().unwrap_or_else(|e| e.into_inner()))
    }
}
