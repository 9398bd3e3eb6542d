//! Direct TCP transport: the remote endpoint is dialed from this host

use super::{channel, RemoteChannel, RemoteTransport, TransportConfig, TransportError};
use crate::address::RemoteAddress;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Transport that opens a plain TCP connection per channel
pub struct DirectTransport {
    config: TransportConfig,
}

impl DirectTransport {
    /// Create a new direct transport
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    pub fn new_default() -> Self {
        Self::new(TransportConfig::default())
    }

    async fn resolve(&self, remote: &RemoteAddress) -> Result<Vec<SocketAddr>, TransportError> {
        match remote {
            RemoteAddress::Resolved(addr) => Ok(vec![addr.to_native_address()]),
            RemoteAddress::Named { host, port } => {
                let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| TransportError::Resolve(format!("{}: {}", host, e)))?
                    .collect();
                if addrs.is_empty() {
                    return Err(TransportError::Resolve(format!("{}: no addresses", host)));
                }
                Ok(addrs)
            }
        }
    }

    async fn dial(&self, addrs: &[SocketAddr]) -> Result<TcpStream, TransportError> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let mut last_error = None;

        for addr in addrs {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).ok();
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!(%addr, error = %e, "Remote connect failed");
                    last_error = Some(TransportError::ConnectionFailed(format!("{}: {}", addr, e)));
                }
                Err(_) => {
                    debug!(%addr, "Remote connect timed out");
                    last_error = Some(TransportError::Timeout);
                }
            }
        }

        Err(last_error.unwrap_or(TransportError::Closed))
    }
}

#[async_trait]
impl RemoteTransport for DirectTransport {
    async fn open_connection(
        &self,
        remote: &RemoteAddress,
    ) -> Result<RemoteChannel, TransportError> {
        let addrs = self.resolve(remote).await?;
        let stream = self.dial(&addrs).await?;
        let peer = stream.peer_addr()?;
        debug!(%remote, %peer, "Remote connection established");

        let (local, remote_end) = channel(self.config.channel_capacity);
        let (mut chunks, mut events) = remote_end.into_split();
        let (mut read_half, mut write_half) = stream.into_split();
        let buffer_size = self.config.buffer_size;

        // Remote socket -> tunnel, until either side lets go
        tokio::spawn(async move {
            let mut buf = vec![0u8; buffer_size];
            loop {
                let read = tokio::select! {
                    read = read_half.read(&mut buf) => read,
                    _ = events.closed() => {
                        trace!(%peer, "Tunnel released channel");
                        break;
                    }
                };

                match read {
                    Ok(0) => {
                        trace!(%peer, "Remote EOF");
                        break;
                    }
                    Ok(n) => {
                        if events.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(%peer, error = %e, "Remote read error");
                        events.fail(TransportError::Io(e)).await.ok();
                        break;
                    }
                }
            }
        });

        // Tunnel -> remote socket
        tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                if let Err(e) = write_half.write_all(&chunk).await {
                    debug!(%peer, error = %e, "Remote write error");
                    return;
                }
            }
            // Tunnel closed its send half
            write_half.shutdown().await.ok();
        });

        Ok(local)
    }
}
