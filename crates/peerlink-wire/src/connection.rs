//! A single TCP link to a peer.
//!
//! A [`Connection`] owns one socket. The socket itself lives in two tasks
//! started by [`spawn_io`]: a reader that decodes inbound messages and a
//! writer that drains the connection's frame queue in order. The
//! `Connection` value is the handle shared through the registry: it carries
//! the identity, the lifecycle state, and the channels into those tasks.

use crate::codec::WireCodec;
use crate::dispatcher::InFlight;
use crate::error::{WireError, WireResult};
use crate::framing::MessageDecoder;
use crate::identity::ConnectionIdentity;
use chrono::{DateTime, Utc};
use peerlink_types::message::Message;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Who opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener.
    Inbound,
    /// Opened by our dispatcher.
    Outbound,
}

/// Encoded bytes queued for the writer task.
#[derive(Debug)]
pub struct OutboundFrame {
    /// In-flight tracking id.
    pub seq: u64,
    pub bytes: Vec<u8>,
    /// Message summary for diagnostics.
    pub summary: String,
}

/// Receiving ends handed to the I/O tasks.
pub struct ConnectionIo {
    frames: mpsc::UnboundedReceiver<OutboundFrame>,
    close: watch::Receiver<bool>,
}

/// Callbacks from a connection's I/O tasks.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A complete message was decoded.
    fn on_message(&self, conn: &Arc<Connection>, msg: Message);

    /// The reader stopped; the connection is closed. `reason` is `None` for
    /// an orderly close.
    fn on_closed(&self, conn: &Arc<Connection>, reason: Option<WireError>);
}

/// Handle to one link.
pub struct Connection {
    identity: ConnectionIdentity,
    direction: Direction,
    state: AtomicU8,
    /// Listening address of the remote platform.
    peer_addr: RwLock<Option<SocketAddr>>,
    frames: mpsc::UnboundedSender<OutboundFrame>,
    close_tx: watch::Sender<bool>,
    opened_at: DateTime<Utc>,
}

impl Connection {
    /// Create a connection handle in the `Connecting` state.
    ///
    /// Outbound links know the peer's listening address up front: it is the
    /// address we dialled. Inbound links learn it from the first message.
    pub fn new(identity: ConnectionIdentity, direction: Direction) -> (Arc<Self>, ConnectionIo) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let peer_addr = match direction {
            Direction::Outbound => identity.remote_socket_addr(),
            Direction::Inbound => None,
        };
        let conn = Arc::new(Self {
            identity,
            direction,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            peer_addr: RwLock::new(peer_addr),
            frames: frames_tx,
            close_tx,
            opened_at: Utc::now(),
        });
        (
            conn,
            ConnectionIo {
                frames: frames_rx,
                close: close_rx,
            },
        )
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn key(&self) -> String {
        self.identity.key()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Transition `Connecting -> Open`. No effect in any other state.
    pub fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Listening address of the remote platform, once known.
    pub fn peer_address(&self) -> Option<SocketAddr> {
        *self.peer_addr.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_peer_address(&self, addr: SocketAddr) {
        *self.peer_addr.write().unwrap_or_else(|e| e.into_inner()) = Some(addr);
    }

    /// Queue encoded bytes for the writer task.
    pub fn send(&self, frame: OutboundFrame) -> WireResult<()> {
        if !self.is_open() {
            return Err(WireError::NotConnected {
                addr: self.identity.remote_address(),
            });
        }
        self.frames
            .send(frame)
            .map_err(|_| WireError::NotConnected {
                addr: self.identity.remote_address(),
            })
    }

    /// Ask the I/O tasks to stop. The reader reports the close to the
    /// connection handler, which removes the link from the registry.
    pub fn close(&self) {
        let _ = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            match ConnectionState::from_u8(s) {
                ConnectionState::Connecting | ConnectionState::Open => {
                    Some(ConnectionState::Closing as u8)
                }
                _ => None,
            }
        });
        // Must stick even when the I/O tasks, and their receivers, are gone.
        self.close_tx.send_replace(true);
    }

    /// Whether a close has been requested.
    pub fn close_requested(&self) -> bool {
        *self.close_tx.borrow()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.identity.key())
            .field("direction", &self.direction)
            .field("state", &self.state())
            .field("peer", &self.peer_address())
            .finish()
    }
}

/// Start the reader and writer tasks for an established socket.
pub fn spawn_io(
    conn: Arc<Connection>,
    io: ConnectionIo,
    stream: TcpStream,
    codec: Arc<dyn WireCodec>,
    handler: Arc<dyn ConnectionHandler>,
    in_flight: Arc<InFlight>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let ConnectionIo {
        mut frames,
        close: close_rx,
    } = io;

    conn.mark_open();

    // Writer: one task per connection keeps per-link send order.
    let writer_conn = Arc::clone(&conn);
    let mut writer_close = close_rx.clone();
    let writer_flight = Arc::clone(&in_flight);
    tokio::spawn(async move {
        let remote = writer_conn.identity().remote_address();
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    let result = match writer.write_all(&frame.bytes).await {
                        Ok(()) => writer.flush().await.map_err(|e| WireError::from_io(e, &remote)),
                        Err(e) => Err(WireError::from_io(e, &remote)),
                    };
                    let failed = result.is_err();
                    writer_flight.complete(frame.seq, result);
                    if failed {
                        writer_conn.close();
                        break;
                    }
                }
                _ = writer_close.changed() => break,
            }
        }
        // Anything still queued will never reach the wire.
        frames.close();
        while let Ok(frame) = frames.try_recv() {
            writer_flight.complete(
                frame.seq,
                Err(WireError::NotConnected {
                    addr: remote.clone(),
                }),
            );
        }
        let _ = writer.shutdown().await;
        debug!(peer = %remote, "Writer stopped");
    });

    // Reader
    let mut reader_close = close_rx;
    tokio::spawn(async move {
        let remote = conn.identity().remote_address();
        let mut decoder = MessageDecoder::new(codec);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let reason = 'read: loop {
            if *reader_close.borrow() {
                break None;
            }
            tokio::select! {
                read = reader.read(&mut buf) => {
                    match read {
                        Ok(0) => break None,
                        Ok(n) => {
                            decoder.feed(&buf[..n]);
                            loop {
                                match decoder.next_message() {
                                    Ok(Some(msg)) => handler.on_message(&conn, msg),
                                    Ok(None) => break,
                                    Err(e) => {
                                        warn!(peer = %remote, error = %e, "Protocol error, closing connection");
                                        break 'read Some(e);
                                    }
                                }
                            }
                        }
                        Err(e) => break Some(WireError::from_io(e, &remote)),
                    }
                }
                _ = reader_close.changed() => break None,
            }
        };
        conn.close();
        conn.mark_closed();
        handler.on_closed(&conn, reason);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ConnectionIdentity {
        ConnectionIdentity::new("127.0.0.1", 9000, "127.0.0.1", 50000)
    }

    #[test]
    fn test_state_transitions() {
        let (conn, _io) = Connection::new(identity(), Direction::Outbound);
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.mark_open());
        assert!(!conn.mark_open());
        assert!(conn.is_open());
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(conn.close_requested());
        conn.mark_closed();
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_close_sticks_without_io_tasks() {
        let (conn, io) = Connection::new(identity(), Direction::Inbound);
        drop(io);
        conn.close();
        assert!(conn.close_requested());
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_peer_address_by_direction() {
        let (out, _io) = Connection::new(identity(), Direction::Outbound);
        assert_eq!(out.peer_address(), Some("127.0.0.1:9000".parse().unwrap()));

        let (inbound, _io) = Connection::new(identity(), Direction::Inbound);
        assert_eq!(inbound.peer_address(), None);
        inbound.set_peer_address("127.0.0.1:4444".parse().unwrap());
        assert_eq!(inbound.peer_address(), Some("127.0.0.1:4444".parse().unwrap()));
    }

    #[test]
    fn test_send_requires_open() {
        let (conn, mut io) = Connection::new(identity(), Direction::Outbound);
        let frame = || OutboundFrame {
            seq: 1,
            bytes: vec![1, 2, 3],
            summary: "test".into(),
        };
        assert!(matches!(
            conn.send(frame()),
            Err(WireError::NotConnected { .. })
        ));
        conn.mark_open();
        conn.send(frame()).unwrap();
        assert_eq!(io.frames.try_recv().unwrap().bytes, vec![1, 2, 3]);
    }
}
