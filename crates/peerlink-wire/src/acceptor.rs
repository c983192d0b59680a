//! Inbound listener.
//!
//! Binding retries while the port is busy: either on the next higher port
//! (dynamic port selection) or on the same port after a fixed backoff. The
//! first failure publishes `NetworkStartDelayed`; running out of attempts
//! publishes `NetworkStartFailed` and fails startup.

use crate::codec::WireCodec;
use crate::collaborators::EventSink;
use crate::connection::{spawn_io, Connection, ConnectionHandler, Direction};
use crate::dispatcher::InFlight;
use crate::error::{WireError, WireResult};
use crate::identity::ConnectionIdentity;
use crate::registry::ConnectionRegistry;
use peerlink_types::config::NetworkConfig;
use peerlink_types::event::NetworkEvent;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bind behaviour, snapshotted from [`NetworkConfig`].
#[derive(Debug, Clone)]
pub struct AcceptorSettings {
    pub host: String,
    pub port: u16,
    pub dynamic_port: bool,
    /// Consecutive address-in-use failures tolerated before giving up.
    pub retry_threshold: u32,
    pub backoff: Duration,
    /// Bound on waiting for the accept loop to stop.
    pub shutdown_timeout: Duration,
}

impl From<&NetworkConfig> for AcceptorSettings {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            host: config.listen_host.clone(),
            port: config.listen_port,
            dynamic_port: config.dynamic_port,
            retry_threshold: config.bind_retry_threshold.max(1),
            backoff: config.bind_retry_backoff(),
            shutdown_timeout: config.drain_timeout(),
        }
    }
}

/// Bind the listening socket, retrying while the address is in use.
pub async fn bind_with_retry(
    settings: &AcceptorSettings,
    events: &dyn EventSink,
) -> WireResult<TcpListener> {
    let mut port = settings.port;
    let mut failures: u32 = 0;
    loop {
        match TcpListener::bind((settings.host.as_str(), port)).await {
            Ok(listener) => {
                if failures > 0 {
                    info!(port, failures, "Listener bound after retries");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                failures += 1;
                if failures == 1 {
                    warn!(port, "Port in use, network start delayed");
                    events.publish(NetworkEvent::NetworkStartDelayed { port });
                }
                if failures >= settings.retry_threshold {
                    error!(port, attempts = failures, "Giving up binding listener");
                    events.publish(NetworkEvent::NetworkStartFailed {
                        port,
                        attempts: failures,
                    });
                    return Err(WireError::StartupFailed {
                        port,
                        attempts: failures,
                    });
                }
                if settings.dynamic_port && port != 0 && port < u16::MAX {
                    port += 1;
                    debug!(port, "Trying next port");
                } else {
                    tokio::time::sleep(settings.backoff).await;
                }
            }
            Err(e) => {
                return Err(WireError::BindUnavailable {
                    port,
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// The inbound half of the connection lifecycle.
pub struct Acceptor {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    shutdown_timeout: Duration,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    /// Bind the listener. Accepting starts with [`Acceptor::start`].
    pub async fn bind(settings: &AcceptorSettings, events: &dyn EventSink) -> WireResult<Self> {
        let listener = bind_with_retry(settings, events).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Listening");
        events.publish(NetworkEvent::NetworkStarted {
            address: local_addr.to_string(),
        });
        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            shutdown_timeout: settings.shutdown_timeout,
            stop_tx,
            task: Mutex::new(None),
        })
    }

    /// Actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Start accepting. Each inbound link is registered and its I/O tasks
    /// started. Calling this twice has no effect.
    pub fn start(
        &self,
        registry: ConnectionRegistry,
        codec: Arc<dyn WireCodec>,
        handler: Arc<dyn ConnectionHandler>,
        in_flight: Arc<InFlight>,
    ) {
        let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            if let Err(e) = accept_one(stream, &registry, &codec, &handler, &in_flight) {
                                warn!(peer = %remote, error = %e, "Failed to set up inbound connection");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                    _ = stop_rx.changed() => break,
                }
            }
            // Dropping the listener unbinds the port.
            drop(listener);
            debug!("Accept loop stopped");
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop accepting and release the port, waiting a bounded time for the
    /// loop to finish.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.shutdown_timeout, &mut task)
                .await
                .is_err()
            {
                warn!(address = %self.local_addr, "Accept loop did not stop in time, aborting");
                task.abort();
            }
        }
        info!(address = %self.local_addr, "Listener closed");
    }
}

fn accept_one(
    stream: TcpStream,
    registry: &ConnectionRegistry,
    codec: &Arc<dyn WireCodec>,
    handler: &Arc<dyn ConnectionHandler>,
    in_flight: &Arc<InFlight>,
) -> WireResult<()> {
    let remote = stream.peer_addr()?;
    let local = stream.local_addr()?;
    let identity = ConnectionIdentity::from_addrs(remote, local);
    let (conn, io) = Connection::new(identity, Direction::Inbound);
    if !registry.register(Arc::clone(&conn)) {
        warn!(key = %conn.key(), "Duplicate inbound connection dropped");
        return Ok(());
    }
    spawn_io(
        Arc::clone(&conn),
        io,
        stream,
        Arc::clone(codec),
        Arc::clone(handler),
        Arc::clone(in_flight),
    );
    info!(peer = %remote, key = %conn.key(), "Inbound connection accepted");
    Ok(())
}
