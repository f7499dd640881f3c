//! Per-connection handle owned by the registry.
//!
//! The hub never touches the socket. It enqueues [`Outbound`] items on a
//! bounded channel drained by the connection's transport task, and can ask
//! that task to drop the socket via [`ConnectionHandle::terminate`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::protocol::CloseReason;

/// Registry-assigned connection identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Item queued for the transport task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Pre-encoded JSON text frame
    Text(Arc<str>),
    /// Liveness probe
    Ping,
    /// Send a close frame and end the connection
    Close(CloseReason),
}

/// Error when enqueueing to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Connection is closed or terminated
    Closed,
    /// Outbound queue is full; the peer is not keeping up
    Full,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed => write!(f, "connection closed"),
            SendError::Full => write!(f, "outbound queue full"),
        }
    }
}

impl std::error::Error for SendError {}

/// Liveness and delivery state for one registered connection
pub struct ConnectionHandle {
    id: ConnectionId,
    addr: SocketAddr,
    tx: mpsc::Sender<Outbound>,
    /// Cleared by each liveness probe, set again by a pong
    alive: AtomicBool,
    /// False once the connection is unregistered or terminated
    open: AtomicBool,
    terminate: Notify,
}

impl ConnectionHandle {
    pub(crate) fn new(id: ConnectionId, addr: SocketAddr, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            addr,
            tx,
            alive: AtomicBool::new(true),
            open: AtomicBool::new(true),
            terminate: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Record a liveness proof (pong)
    pub(crate) fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    /// Clear the alive flag, returning whether it was set
    pub(crate) fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Non-blocking enqueue
    pub fn send(&self, item: Outbound) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Mark closed without waking the transport task
    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Mark closed and tell the transport task to drop the socket
    pub(crate) fn terminate(&self) {
        self.close();
        self.terminate.notify_one();
    }

    /// Resolves once [`terminate`](Self::terminate) has been called
    pub async fn terminated(&self) {
        self.terminate.notified().await;
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("alive", &self.is_alive())
            .field("open", &self.is_open())
            .finish()
    }
}
