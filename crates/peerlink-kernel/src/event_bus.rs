//! Event bus: pub/sub for network events with a history ring buffer.

use peerlink_types::event::{Event, NetworkEvent};
use peerlink_wire::EventSink;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum events retained in the history ring buffer.
const HISTORY_SIZE: usize = 1000;

/// Fan-out of network events to any number of subscribers.
pub struct EventBus {
    /// Broadcast channel for all events.
    sender: broadcast::Sender<Event>,
    /// Event history ring buffer.
    history: Mutex<VecDeque<Event>>,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_SIZE)),
        }
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Most recent events, newest first.
    pub fn history(&self, limit: usize) -> Vec<Event> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Number of retained events with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.payload.name() == name)
            .count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn publish(&self, payload: NetworkEvent) {
        let event = Event::new(payload);
        debug!(
            event_id = %event.id,
            event = event.payload.name(),
            "Publishing event"
        );

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() >= HISTORY_SIZE {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_history() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_all();
        bus.publish(NetworkEvent::PeerConnected {
            address: "127.0.0.1:9000".into(),
        });
        bus.publish(NetworkEvent::PeerSynchronized {
            address: "127.0.0.1:9000".into(),
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload.name(), "peer_connected");

        let history = bus.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].payload.name(), "peer_synchronized");
        assert_eq!(bus.count("peer_connected"), 1);
    }

    #[test]
    fn test_history_ring_buffer_limit() {
        let bus = EventBus::new();
        for port in 0..(HISTORY_SIZE as u16 + 10) {
            bus.publish(NetworkEvent::NetworkStartDelayed { port });
        }
        let history = bus.history(usize::MAX);
        assert_eq!(history.len(), HISTORY_SIZE);
        assert_eq!(
            history[0].payload,
            NetworkEvent::NetworkStartDelayed {
                port: HISTORY_SIZE as u16 + 9
            }
        );
    }
}
