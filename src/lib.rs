//! # portfwd
//!
//! Local TCP port forwarding over a pluggable remote transport.
//!
//! A tunnel listens on a local port. Every accepted connection gets its own
//! duplex channel to a configured remote endpoint, opened through a
//! [`transport::RemoteTransport`], and bytes are copied both ways until
//! either side finishes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 PortForwardServer                    │
//! │       (listener, accept loop, connection tasks)      │
//! ├─────────────────────────────────────────────────────┤
//! │                 ConnectionBridge                     │
//! │      (local -> remote loop, remote -> local loop)    │
//! ├─────────────────────────────────────────────────────┤
//! │                  RemoteChannel                       │
//! │         (chunk send half, chunk receive half)        │
//! ├─────────────────────────────────────────────────────┤
//! │                 RemoteTransport                      │
//! │          (direct TCP, or any session layer)          │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Shutdown is cooperative: every blocking point is bounded by a short
//! timeout, after which the governing [`CancellationToken`] is rechecked.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod address;
pub mod config;
pub mod pool;
pub mod transport;
pub mod tunnel;

pub use address::{RemoteAddress, ResolvedAddress, ResolvedHost};
pub use config::Config;
pub use pool::WorkerPool;
pub use tunnel::{PortForwardServer, TunnelHandle, TunnelOptions, TunnelSpec};

use std::time::Duration;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of one forwarded chunk (4 KB)
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Listen backlog for tunnel listeners
pub const DEFAULT_BACKLOG: u32 = 1024;

/// Bound on a single accept, read or write before cancellation is rechecked
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address error: {0}")]
    Address(#[from] address::AddressError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
