//! Connection handles and the broadcast emitter
//!
//! A [`ConnectionHandle`] is the broker's only way to reach a client: events
//! are pushed onto the connection's outbound queue and written to the socket
//! by the connection task, so no socket I/O ever happens inside the broker.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::Identity;
use crate::protocol::{ServerEvent, ServerFrame};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames a connection may have queued before it is considered stuck
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Process-unique connection identifier. Ids are never reused, so a stale id
/// left over from a closed session can not address a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to an admitted WebSocket connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Connection ID
    pub id: ConnectionId,
    /// Identity verified at handshake, immutable for the life of the connection
    pub identity: Identity,
    /// Client address
    pub addr: SocketAddr,
    /// Channel for sending frames to the connection
    sender: mpsc::Sender<ServerFrame>,
    /// Cancelled once the outbound queue overflows
    overflow: CancellationToken,
}

impl ConnectionHandle {
    /// Create a new connection handle
    pub fn new(
        id: ConnectionId,
        identity: Identity,
        addr: SocketAddr,
        sender: mpsc::Sender<ServerFrame>,
    ) -> Self {
        Self {
            id,
            identity,
            addr,
            sender,
            overflow: CancellationToken::new(),
        }
    }

    /// Queue a frame for this connection without waiting.
    ///
    /// A full queue means the client stopped reading: the overflow token is
    /// cancelled so the connection task drops the connection.
    pub fn send(&self, frame: impl Into<ServerFrame>) -> Result<(), ConnectionError> {
        match self.sender.try_send(frame.into()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                if !self.overflow.is_cancelled() {
                    warn!("Outbound queue of connection {} is full", self.id);
                    self.overflow.cancel();
                }
                Err(ConnectionError::Full(self.id))
            }
            Err(TrySendError::Closed(_)) => Err(ConnectionError::Closed),
        }
    }

    /// Resolves once the outbound queue has overflowed
    pub fn overflow(&self) -> &CancellationToken {
        &self.overflow
    }
}

/// Whether a room broadcast is also delivered to the connection that caused it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    Include,
    ExcludeOrigin,
}

/// Admitted connections, owned by the broker task
#[derive(Debug, Default)]
pub struct ConnectionPool {
    connections: HashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current connection count
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Add a connection to the pool
    pub fn add(&mut self, handle: ConnectionHandle) {
        self.connections.insert(handle.id, handle);
    }

    /// Remove a connection from the pool
    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.remove(&id)
    }

    /// Get a connection by ID
    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.connections.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Send an event to a specific connection
    pub fn send_to(&self, id: ConnectionId, event: ServerEvent) -> Result<(), ConnectionError> {
        match self.connections.get(&id) {
            Some(handle) => handle.send(event),
            None => Err(ConnectionError::NotFound(id)),
        }
    }

    /// Deliver an event to every listed member.
    ///
    /// Members whose queue is closed are skipped; their disconnect cleanup
    /// is already on its way to the broker.
    pub fn broadcast(
        &self,
        members: &[ConnectionId],
        event: &ServerEvent,
        origin: ConnectionId,
        echo: Echo,
    ) -> usize {
        let mut delivered = 0;
        for member in members {
            if echo == Echo::ExcludeOrigin && *member == origin {
                continue;
            }
            match self.send_to(*member, event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Skipping {} for connection {}: {}", event.name(), member, e),
            }
        }
        delivered
    }
}

/// Connection-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,
    #[error("Connection not found: {0}")]
    NotFound(ConnectionId),
    #[error("Outbound queue of connection {0} is full")]
    Full(ConnectionId),
}
