//! Accepted local connections and their registry

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::trace;

/// Connection ID, unique per server instance, assigned in acceptance order
pub type ConnectionId = u64;

/// Connection state
///
/// States only move forward: `Accepted -> Forwarding -> Closing -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Socket accepted, remote channel not yet open
    Accepted = 0,
    /// Bridge running
    Forwarding = 1,
    /// Both directions done, releasing resources
    Closing = 2,
    /// Socket and channel released
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Accepted,
            1 => ConnectionState::Forwarding,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Shared per-connection bookkeeping
pub(crate) struct ConnectionEntry {
    id: ConnectionId,
    peer: SocketAddr,
    opened_at: Instant,
    state: AtomicU8,
    bytes_to_remote: AtomicU64,
    bytes_to_local: AtomicU64,
}

impl ConnectionEntry {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn advance(&self, state: ConnectionState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    pub(crate) fn add_to_remote(&self, n: usize) {
        self.bytes_to_remote.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_to_local(&self, n: usize) {
        self.bytes_to_local.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            peer: self.peer,
            state: self.state(),
            age: self.opened_at.elapsed(),
            bytes_to_remote: self.bytes_to_remote.load(Ordering::Relaxed),
            bytes_to_local: self.bytes_to_local.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub state: ConnectionState,
    pub age: Duration,
    pub bytes_to_remote: u64,
    pub bytes_to_local: u64,
}

/// Live connections of one server
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<ConnectionId, Arc<ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of connections not yet closed
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live connection, ordered by id
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self.lock().values().map(|e| e.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Snapshot of one connection
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.lock().get(&id).map(|e| e.info())
    }

    fn register(&self, peer: SocketAddr) -> Arc<ConnectionEntry> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(ConnectionEntry {
            id,
            peer,
            opened_at: Instant::now(),
            state: AtomicU8::new(ConnectionState::Accepted as u8),
            bytes_to_remote: AtomicU64::new(0),
            bytes_to_local: AtomicU64::new(0),
        });
        self.lock().insert(id, Arc::clone(&entry));
        entry
    }

    fn remove(&self, id: ConnectionId) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Arc<ConnectionEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// An accepted local connection
///
/// Owns its socket exclusively. Dropping it marks it `Closed` and removes it
/// from the registry.
pub struct Connection {
    entry: Arc<ConnectionEntry>,
    registry: Arc<ConnectionRegistry>,
    stream: TcpStream,
    shut_down: bool,
}

impl Connection {
    /// Register a freshly accepted socket
    pub fn accept(registry: &Arc<ConnectionRegistry>, stream: TcpStream, peer: SocketAddr) -> Self {
        let entry = registry.register(peer);
        trace!(connection_id = entry.id, %peer, "Connection registered");
        Self {
            entry,
            registry: Arc::clone(registry),
            stream,
            shut_down: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.entry.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.entry.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.entry.state()
    }

    /// Move to a later state; earlier states are ignored
    pub fn set_state(&self, state: ConnectionState) {
        self.entry.advance(state);
    }

    pub fn info(&self) -> ConnectionInfo {
        self.entry.info()
    }

    pub(crate) fn io_parts(&mut self) -> (&mut TcpStream, &ConnectionEntry) {
        (&mut self.stream, &self.entry)
    }

    /// Shut the socket down. Idempotent; errors are ignored.
    pub async fn close(&mut self) {
        self.set_state(ConnectionState::Closing);
        if !self.shut_down {
            self.shut_down = true;
            self.stream.shutdown().await.ok();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.entry.advance(ConnectionState::Closed);
        self.registry.remove(self.entry.id);
        trace!(connection_id = self.entry.id, "Connection closed");
    }
}
