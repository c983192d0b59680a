//! Shutdown signalling for the platform and the tasks it spawns.

use tokio::sync::watch;
use tracing::info;

/// Shutdown signal manager.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            shutdown_tx: tx,
            shutdown_rx: rx,
        }
    }

    /// Get a receiver that will be notified on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Trigger a graceful shutdown. Repeated calls are harmless.
    pub fn shutdown(&self) {
        if self.is_shutting_down() {
            return;
        }
        info!("Supervisor: initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Resolve once shutdown has been requested.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `self`, so this only errors if it was dropped.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
