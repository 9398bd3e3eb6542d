//! Duplex forwarding between one local connection and its remote channel
//!
//! Two loops run concurrently, each owning one direction:
//!
//! ```text
//!   local socket ──read──▶ [Bytes] ──▶ ChannelSender      (local -> remote)
//!   local socket ◀─write── [Bytes] ◀── ChannelReceiver    (remote -> local)
//! ```
//!
//! Every suspension point is bounded by a timeout. When it expires the loop
//! rechecks the connection's cancellation token and retries if the token is
//! still live. All bounded operations are cancel-safe, so an expired attempt
//! loses no data.

use super::connection::{Connection, ConnectionEntry, ConnectionId};
use crate::transport::{ChannelEvent, ChannelReceiver, ChannelSender, RemoteChannel, TransportError};
use bytes::Bytes;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Bridge tuning
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Maximum chunk size read from the local socket
    pub buffer_size: usize,
    /// Bound on a local read or channel receive before rechecking cancellation
    pub read_timeout: Duration,
    /// Bound on a local write or channel send before rechecking cancellation
    pub write_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_size: crate::DEFAULT_BUFFER_SIZE,
            read_timeout: crate::DEFAULT_IO_TIMEOUT,
            write_timeout: crate::DEFAULT_IO_TIMEOUT,
        }
    }
}

/// Why a forwarding loop stopped
///
/// Scoped to one loop of one connection. None of these are errors of the
/// tunnel itself.
#[derive(Debug)]
pub enum LoopExit {
    /// Source finished cleanly
    Eof,
    /// Lifetime cancelled (server shutdown or the other direction failed)
    Cancelled,
    /// Remote side closed the send half while data was still flowing
    PeerClosed,
    /// Local socket failed (reset, abort, write error)
    LocalFault(io::Error),
    /// Remote transport reported a network failure
    RemoteFault(TransportError),
}

impl LoopExit {
    pub fn is_fault(&self) -> bool {
        matches!(self, LoopExit::LocalFault(_) | LoopExit::RemoteFault(_))
    }
}

/// Outcome of one bridge run
#[derive(Debug)]
pub struct BridgeReport {
    pub local_to_remote: LoopExit,
    pub remote_to_local: LoopExit,
    pub bytes_to_remote: u64,
    pub bytes_to_local: u64,
}

/// Forwards one connection until both directions have terminated
pub struct ConnectionBridge {
    id: ConnectionId,
    cancel: CancellationToken,
    config: BridgeConfig,
}

impl ConnectionBridge {
    /// `cancel` should be scoped to this connection: a fault in one direction
    /// cancels it to stop the other.
    pub fn new(id: ConnectionId, cancel: CancellationToken, config: BridgeConfig) -> Self {
        Self { id, cancel, config }
    }

    /// Run both loops to completion
    ///
    /// The caller still owns, and must close, the socket and the channel.
    pub async fn run(&self, connection: &mut Connection, channel: &mut RemoteChannel) -> BridgeReport {
        let (stream, entry) = connection.io_parts();
        let (mut reader, mut writer) = stream.split();
        let (sender, receiver) = channel.halves();

        let ((local_to_remote, bytes_to_remote), (remote_to_local, bytes_to_local)) = tokio::join!(
            self.local_to_remote(&mut reader, sender, entry),
            self.remote_to_local(&mut writer, receiver, entry),
        );

        debug!(
            connection_id = self.id,
            ?local_to_remote,
            ?remote_to_local,
            bytes_to_remote,
            bytes_to_local,
            "Bridge finished"
        );

        BridgeReport {
            local_to_remote,
            remote_to_local,
            bytes_to_remote,
            bytes_to_local,
        }
    }

    async fn local_to_remote<R>(
        &self,
        reader: &mut R,
        sender: &mut ChannelSender,
        entry: &ConnectionEntry,
    ) -> (LoopExit, u64)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.config.buffer_size];
        let mut total = 0u64;

        loop {
            let n = match timeout(self.config.read_timeout, reader.read(&mut buf)).await {
                Err(_) => {
                    if self.cancel.is_cancelled() {
                        sender.close();
                        return (LoopExit::Cancelled, total);
                    }
                    continue;
                }
                Ok(Ok(0)) => {
                    debug!(connection_id = self.id, "Local EOF");
                    sender.close();
                    return (LoopExit::Eof, total);
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    sender.close();
                    return (self.local_fault(e, "Local read error"), total);
                }
            };

            // Fresh chunk per read; `buf` is reused on the next iteration
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            if let Err(exit) = self.send_chunk(sender, chunk).await {
                return (exit, total);
            }
            trace!(connection_id = self.id, n, "Forwarded to remote");
            total += n as u64;
            entry.add_to_remote(n);
        }
    }

    async fn send_chunk(&self, sender: &ChannelSender, chunk: Bytes) -> Result<(), LoopExit> {
        loop {
            match timeout(self.config.write_timeout, sender.reserve()).await {
                Err(_) => {
                    if self.cancel.is_cancelled() {
                        return Err(LoopExit::Cancelled);
                    }
                }
                Ok(Ok(permit)) => {
                    permit.send(chunk);
                    return Ok(());
                }
                Ok(Err(_)) => {
                    debug!(connection_id = self.id, "Remote send half closed");
                    return Err(LoopExit::PeerClosed);
                }
            }
        }
    }

    async fn remote_to_local<W>(
        &self,
        writer: &mut W,
        receiver: &mut ChannelReceiver,
        entry: &ConnectionEntry,
    ) -> (LoopExit, u64)
    where
        W: AsyncWrite + Unpin,
    {
        let mut total = 0u64;

        loop {
            let event = match timeout(self.config.read_timeout, receiver.recv()).await {
                Err(_) => {
                    if self.cancel.is_cancelled() {
                        return (LoopExit::Cancelled, total);
                    }
                    continue;
                }
                Ok(event) => event,
            };

            match event {
                Some(ChannelEvent::Data(chunk)) => {
                    if let Err(exit) = self.write_chunk(writer, &chunk).await {
                        return (exit, total);
                    }
                    trace!(connection_id = self.id, n = chunk.len(), "Forwarded to local");
                    total += chunk.len() as u64;
                    entry.add_to_local(chunk.len());
                }
                Some(ChannelEvent::Error(e)) => {
                    warn!(connection_id = self.id, error = %e, "Remote network failure");
                    self.cancel.cancel();
                    return (LoopExit::RemoteFault(e), total);
                }
                None => {
                    debug!(connection_id = self.id, "Remote EOF");
                    writer.flush().await.ok();
                    // Half-close so the client sees EOF while it may still send
                    writer.shutdown().await.ok();
                    return (LoopExit::Eof, total);
                }
            }
        }
    }

    async fn write_chunk<W>(&self, writer: &mut W, chunk: &[u8]) -> Result<(), LoopExit>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0;
        while written < chunk.len() {
            match timeout(self.config.write_timeout, writer.write(&chunk[written..])).await {
                Err(_) => {
                    if self.cancel.is_cancelled() {
                        return Err(LoopExit::Cancelled);
                    }
                }
                Ok(Ok(0)) => {
                    return Err(self.local_fault(io::ErrorKind::WriteZero.into(), "Local write error"));
                }
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(self.local_fault(e, "Local write error")),
            }
        }

        writer
            .flush()
            .await
            .map_err(|e| self.local_fault(e, "Local flush error"))
    }

    /// A local socket fault stops this connection only
    fn local_fault(&self, error: io::Error, context: &'static str) -> LoopExit {
        warn!(connection_id = self.id, error = %error, "{}", context);
        self.cancel.cancel();
        LoopExit::LocalFault(error)
    }
}
