//! Tunnel layer - local listener to remote channel forwarding
//!
//! Provides:
//! - Accept loop and per-connection lifecycle ([`PortForwardServer`])
//! - Duplex forwarding loops ([`ConnectionBridge`])
//! - Live connection tracking ([`ConnectionRegistry`])

mod bridge;
mod connection;
mod server;

pub use bridge::{BridgeConfig, BridgeReport, ConnectionBridge, LoopExit};
pub use connection::{Connection, ConnectionId, ConnectionInfo, ConnectionRegistry, ConnectionState};
pub use server::{PortForwardServer, TunnelHandle};

use crate::address::{parse_port, AddressError, RemoteAddress};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid tunnel spec: {0}")]
    InvalidSpec(String),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel task failed: {0}")]
    Task(String),
}

/// Which remote endpoint connections accepted on a local port map to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub local_port: u16,
    pub remote: RemoteAddress,
}

impl TunnelSpec {
    pub fn new(local_port: u16, remote: impl Into<RemoteAddress>) -> Self {
        Self {
            local_port,
            remote: remote.into(),
        }
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local_port, self.remote)
    }
}

impl FromStr for TunnelSpec {
    type Err = TunnelError;

    /// Parses `LOCAL_PORT:HOST:PORT`, e.g. `9000:10.0.0.5:22` or `9000:[::1]:22`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (local, remote) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| TunnelError::InvalidSpec(format!("expected LOCAL_PORT:HOST:PORT, got '{}'", s)))?;

        Ok(Self {
            local_port: parse_port(local)?,
            remote: remote.parse()?,
        })
    }
}

/// Listener and per-connection tuning
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Local address to bind (localhost by default)
    pub bind_host: IpAddr,
    /// Listen backlog
    pub backlog: u32,
    /// Bound on a single accept attempt before cancellation is rechecked
    pub accept_timeout: Duration,
    /// Bound on a single read attempt before cancellation is rechecked
    pub read_timeout: Duration,
    /// Bound on a single write attempt before cancellation is rechecked
    pub write_timeout: Duration,
    /// Maximum chunk size read from a local socket
    pub buffer_size: usize,
    /// Reject connections beyond this many concurrent ones
    pub max_connections: Option<usize>,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            backlog: crate::DEFAULT_BACKLOG,
            accept_timeout: crate::DEFAULT_IO_TIMEOUT,
            read_timeout: crate::DEFAULT_IO_TIMEOUT,
            write_timeout: crate::DEFAULT_IO_TIMEOUT,
            buffer_size: crate::DEFAULT_BUFFER_SIZE,
            max_connections: None,
        }
    }
}

impl TunnelOptions {
    /// Same timeout for accept, read and write
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self.read_timeout = timeout;
        self.write_timeout = timeout;
        self
    }

    pub(crate) fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            buffer_size: self.buffer_size,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        }
    }
}
