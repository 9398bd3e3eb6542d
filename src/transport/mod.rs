//! Remote transport boundary
//!
//! The tunnel never talks to the remote endpoint itself. It asks a
//! [`RemoteTransport`] for a [`RemoteChannel`] and exchanges byte chunks
//! with it:
//! - [`channel`] builds an in-memory channel pair for transport implementors
//! - [`DirectTransport`] dials the remote endpoint over plain TCP

mod channel;
mod tcp;

pub use channel::{
    channel, ChannelEvent, ChannelReceiver, ChannelSender, RemoteChannel, RemoteEnd,
    RemoteEndReader, RemoteEndWriter,
};
pub use tcp::DirectTransport;

use crate::address::RemoteAddress;
use async_trait::async_trait;
use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Resolve failed: {0}")]
    Resolve(String),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Channel closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Opens duplex chunk channels to remote endpoints
///
/// Failure to open yields the reason as an error and no channel. A returned
/// channel is released when it is dropped.
#[async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
    /// Open a channel to `remote`
    async fn open_connection(&self, remote: &RemoteAddress)
        -> Result<RemoteChannel, TransportError>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Capacity of each channel direction, in chunks
    pub channel_capacity: usize,
    /// Read buffer size for the remote socket
    pub buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            channel_capacity: 64,
            buffer_size: crate::DEFAULT_BUFFER_SIZE,
        }
    }
}
