//! Outbound dispatcher.
//!
//! Every outgoing message goes through one unbounded queue drained by a
//! single background loop, which keeps send order per connection. For each
//! item the loop resolves an open link (dialling the peer when there is
//! none), stamps the sender keys, encodes the message and hands the bytes to
//! the connection's writer task. Undeliverable messages are parked in the
//! [`OutboundBacklog`]; nothing is resent automatically.

use crate::backlog::OutboundBacklog;
use crate::codec::WireCodec;
use crate::connection::{spawn_io, Connection, ConnectionHandler, Direction, OutboundFrame};
use crate::error::{WireError, WireResult};
use crate::framing::encode_for_wire;
use crate::identity::ConnectionIdentity;
use crate::registry::ConnectionRegistry;
use dashmap::DashMap;
use peerlink_types::config::NetworkConfig;
use peerlink_types::message::{keys, Message};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where a queued message should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The platform listening on this address. Dialled if no link is open.
    Peer(SocketAddr),
    /// One specific registered connection. Never dialled.
    Connection(String),
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Peer(addr) => write!(f, "{addr}"),
            Route::Connection(key) => f.write_str(key),
        }
    }
}

#[derive(Debug, Clone)]
struct Outbound {
    message: Message,
    route: Route,
}

/// Identity stamped on every outgoing message.
#[derive(Debug, Clone)]
pub struct SenderStamp {
    /// Host peers should use to reach us.
    pub address: String,
    /// Our listening port.
    pub port: u16,
    /// Our platform id, appended to the node log.
    pub platform_id: String,
}

impl SenderStamp {
    fn apply(&self, msg: &mut Message) {
        msg.insert(keys::SENDER_ADDRESS, self.address.as_str());
        msg.insert(keys::SENDER_PORT, self.port);
        msg.append_node_log(&self.platform_id);
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub connect_attempts: u32,
    pub connect_retry_interval: Duration,
    pub queue_poll: Duration,
    pub drain_timeout: Duration,
}

impl From<&NetworkConfig> for DispatcherSettings {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            connect_attempts: config.connect_attempts.max(1),
            connect_retry_interval: config.connect_retry_interval(),
            queue_poll: config.queue_poll(),
            drain_timeout: config.drain_timeout(),
        }
    }
}

struct InFlightEntry {
    message: Message,
    destination: String,
}

/// Writes handed to connection writer tasks that have not completed yet.
pub struct InFlight {
    entries: DashMap<u64, InFlightEntry>,
    next_seq: AtomicU64,
    settled: Notify,
    backlog: Arc<OutboundBacklog>,
}

impl InFlight {
    pub fn new(backlog: Arc<OutboundBacklog>) -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(1),
            settled: Notify::new(),
            backlog,
        }
    }

    /// Track a write and return its sequence number.
    pub fn begin(&self, message: Message, destination: impl Into<String>) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            seq,
            InFlightEntry {
                message,
                destination: destination.into(),
            },
        );
        seq
    }

    /// Record the outcome of a write. Failures are reported and backlogged,
    /// never requeued.
    pub fn complete(&self, seq: u64, result: WireResult<()>) {
        let Some((_, entry)) = self.entries.remove(&seq) else {
            return;
        };
        match result {
            Ok(()) => debug!(seq, destination = %entry.destination, "Write completed"),
            Err(e) => {
                report_send_failure(&entry.destination, &entry.message, &e);
                self.backlog
                    .record(entry.message, entry.destination, e.to_string());
            }
        }
        self.settled.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait until no write is outstanding, up to `timeout`.
    pub async fn wait_settled(&self, timeout: Duration) -> bool {
        let settled = async {
            loop {
                let notified = self.settled.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.entries.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, settled).await.is_ok()
    }

    /// Give up on every outstanding write. Returns how many were abandoned.
    pub fn abort_all(&self, reason: &str) -> usize {
        let seqs: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        let mut aborted = 0;
        for seq in seqs {
            if let Some((_, entry)) = self.entries.remove(&seq) {
                self.backlog.record(entry.message, entry.destination, reason);
                aborted += 1;
            }
        }
        self.settled.notify_waiters();
        aborted
    }
}

/// Common reporting path for every failed send.
fn report_send_failure(destination: &str, message: &Message, err: &WireError) {
    if err.is_protocol() {
        error!(destination = %destination, message = %message.summary(), error = %err, "Send failed");
    } else {
        warn!(destination = %destination, message = %message.summary(), error = %err, "Send failed");
    }
}

/// Everything the dispatch loop needs to open links and write to them.
struct DispatchContext {
    settings: DispatcherSettings,
    stamp: SenderStamp,
    registry: ConnectionRegistry,
    codec: Arc<dyn WireCodec>,
    backlog: Arc<OutboundBacklog>,
    in_flight: Arc<InFlight>,
    handler: Arc<dyn ConnectionHandler>,
}

/// The outbound half of the connection lifecycle.
pub struct Dispatcher {
    settings: DispatcherSettings,
    stamp: SenderStamp,
    registry: ConnectionRegistry,
    codec: Arc<dyn WireCodec>,
    backlog: Arc<OutboundBacklog>,
    in_flight: Arc<InFlight>,
    /// Taken on shutdown; no enqueues are accepted afterwards.
    queue: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    /// Held by the loop while it runs; reclaimed at shutdown for leftovers.
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Outbound>>>,
    /// The item the loop is working on.
    current: Arc<Mutex<Option<Outbound>>>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        settings: DispatcherSettings,
        stamp: SenderStamp,
        registry: ConnectionRegistry,
        codec: Arc<dyn WireCodec>,
        backlog: Arc<OutboundBacklog>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        let in_flight = Arc::new(InFlight::new(Arc::clone(&backlog)));
        Self {
            settings,
            stamp,
            registry,
            codec,
            backlog,
            in_flight,
            queue: Mutex::new(Some(tx)),
            receiver: Arc::new(AsyncMutex::new(rx)),
            current: Arc::new(Mutex::new(None)),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    pub fn stamp(&self) -> &SenderStamp {
        &self.stamp
    }

    /// Start the background loop. `handler` receives traffic from the
    /// connections the dispatcher opens. Calling this twice has no effect.
    pub fn start(&self, handler: Arc<dyn ConnectionHandler>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() || !self.is_accepting() {
            return;
        }
        let ctx = DispatchContext {
            settings: self.settings.clone(),
            stamp: self.stamp.clone(),
            registry: self.registry.clone(),
            codec: Arc::clone(&self.codec),
            backlog: Arc::clone(&self.backlog),
            in_flight: Arc::clone(&self.in_flight),
            handler,
        };
        let stop_rx = self.stop_tx.subscribe();
        *task = Some(tokio::spawn(dispatch_loop(
            ctx,
            Arc::clone(&self.receiver),
            Arc::clone(&self.current),
            stop_rx,
        )));
    }

    /// Queue a message. Ownership moves to the dispatcher.
    pub fn enqueue(&self, message: Message, route: Route) -> WireResult<()> {
        let guard = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            self.backlog
                .record(message, route.to_string(), "dispatcher shutting down");
            return Err(WireError::ShuttingDown);
        };
        tx.send(Outbound { message, route }).map_err(|rejected| {
            let Outbound { message, route } = rejected.0;
            self.backlog
                .record(message, route.to_string(), "dispatcher stopped");
            WireError::ShuttingDown
        })
    }

    pub fn is_accepting(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Stop accepting messages, drain the queue, settle in-flight writes and
    /// close every connection. Each wait is bounded by the drain timeout.
    pub async fn shutdown(&self) {
        let drain_timeout = self.settings.drain_timeout;

        // Dropping the sender lets the loop drain what is queued and exit.
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).take();
        let _ = self.stop_tx.send(true);

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut task) = task {
            if tokio::time::timeout(drain_timeout, &mut task).await.is_err() {
                warn!(timeout_ms = drain_timeout.as_millis() as u64, "Dispatcher did not drain in time, aborting");
                task.abort();
                // Wait for the cancellation so the receiver lock is released.
                let _ = task.await;
            }
        }
        let abandoned = self.backlog_leftovers("aborted at shutdown");
        if abandoned > 0 {
            warn!(abandoned, "Queued messages were not dispatched before shutdown");
        }

        if !self.in_flight.wait_settled(drain_timeout).await {
            let aborted = self.in_flight.abort_all("aborted at shutdown");
            warn!(aborted, "In-flight writes did not settle in time");
        }

        self.registry.close_all();
        if !self.registry.wait_empty(drain_timeout).await {
            warn!(remaining = self.registry.len(), "Connections still registered after shutdown cutoff");
        }
        info!("Dispatcher stopped");
    }

    /// Backlog the item the loop was working on and everything still queued.
    fn backlog_leftovers(&self, reason: &str) -> usize {
        let mut leftovers: Vec<Outbound> = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .into_iter()
            .collect();
        match self.receiver.try_lock() {
            Ok(mut rx) => {
                while let Ok(item) = rx.try_recv() {
                    leftovers.push(item);
                }
            }
            Err(_) => warn!("Dispatcher queue still locked, leftovers not inspected"),
        }
        let count = leftovers.len();
        for Outbound { message, route } in leftovers {
            self.backlog.record(message, route.to_string(), reason);
        }
        count
    }
}

async fn dispatch_loop(
    ctx: DispatchContext,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Outbound>>>,
    current: Arc<Mutex<Option<Outbound>>>,
    stop_rx: watch::Receiver<bool>,
) {
    let mut rx = receiver.lock().await;
    debug!("Dispatcher loop started");
    loop {
        match tokio::time::timeout(ctx.settings.queue_poll, rx.recv()).await {
            Ok(Some(item)) => {
                *current.lock().unwrap_or_else(|e| e.into_inner()) = Some(item.clone());
                ctx.dispatch(item).await;
                current.lock().unwrap_or_else(|e| e.into_inner()).take();
            }
            Ok(None) => break,
            // Idle poll: a stop request with an empty queue ends the loop.
            Err(_) => {
                if *stop_rx.borrow() && rx.is_empty() {
                    break;
                }
            }
        }
    }
    debug!("Dispatcher loop finished");
}

impl DispatchContext {
    async fn dispatch(&self, item: Outbound) {
        let Outbound { mut message, route } = item;
        self.stamp.apply(&mut message);
        let destination = route.to_string();

        let conn = match self.resolve(&route).await {
            Ok(conn) => conn,
            Err(e) => {
                report_send_failure(&destination, &message, &e);
                self.backlog.record(message, destination, e.to_string());
                return;
            }
        };

        let bytes = match encode_for_wire(self.codec.as_ref(), &message) {
            Ok(bytes) => bytes,
            Err(e) => {
                report_send_failure(&destination, &message, &e);
                self.backlog.record(message, destination, e.to_string());
                return;
            }
        };

        let summary = message.summary();
        let seq = self.in_flight.begin(message, destination);
        if let Err(e) = conn.send(OutboundFrame {
            seq,
            bytes,
            summary,
        }) {
            self.in_flight.complete(seq, Err(e));
        }
    }

    async fn resolve(&self, route: &Route) -> WireResult<Arc<Connection>> {
        match route {
            Route::Connection(key) => self
                .registry
                .get(key)
                .filter(|c| c.is_open())
                .ok_or_else(|| WireError::NotConnected { addr: key.clone() }),
            Route::Peer(addr) => match self.registry.find_by_peer(*addr) {
                Some(conn) => Ok(conn),
                None => self.connect(*addr).await,
            },
        }
    }

    /// Dial `addr` with bounded retries, then register and start the link.
    async fn connect(&self, addr: SocketAddr) -> WireResult<Arc<Connection>> {
        let attempts = self.settings.connect_attempts;
        let interval = self.settings.connect_retry_interval;
        for attempt in 1..=attempts {
            match tokio::time::timeout(interval, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return self.open_outbound(stream),
                Ok(Err(e)) => {
                    let err = WireError::from_io(e, addr);
                    debug!(peer = %addr, attempt, error = %err, "Connect attempt failed");
                }
                Err(_) => debug!(peer = %addr, attempt, "Connect attempt timed out"),
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Err(WireError::Unreachable {
            addr: addr.to_string(),
            attempts,
        })
    }

    fn open_outbound(&self, stream: TcpStream) -> WireResult<Arc<Connection>> {
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let identity = ConnectionIdentity::from_addrs(remote, local);
        let (conn, io) = Connection::new(identity, Direction::Outbound);
        self.registry.register(Arc::clone(&conn));
        spawn_io(
            Arc::clone(&conn),
            io,
            stream,
            Arc::clone(&self.codec),
            Arc::clone(&self.handler),
            Arc::clone(&self.in_flight),
        );
        info!(peer = %remote, key = %conn.key(), "Outbound connection opened");
        Ok(conn)
    }
}
