//! In-memory duplex chunk channel
//!
//! ```text
//!  tunnel side                      transport side
//!  ChannelSender   ── Bytes ──▶     RemoteEnd::recv
//!  ChannelReceiver ◀── ChannelEvent ── RemoteEnd::send / fail
//! ```

use super::TransportError;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Event delivered on the receive half
#[derive(Debug)]
pub enum ChannelEvent {
    /// Chunk received from the remote endpoint
    Data(Bytes),
    /// Remote transport reported a network failure
    Error(TransportError),
}

/// Build a connected channel pair with `capacity` chunks of buffering per direction
pub fn channel(capacity: usize) -> (RemoteChannel, RemoteEnd) {
    let (data_tx, data_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);

    let local = RemoteChannel {
        sender: ChannelSender { tx: Some(data_tx) },
        receiver: ChannelReceiver { rx: event_rx },
    };
    let remote = RemoteEnd {
        rx: data_rx,
        tx: Some(event_tx),
    };
    (local, remote)
}

/// Duplex chunk channel to a remote endpoint
pub struct RemoteChannel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl RemoteChannel {
    /// Borrow both halves at once
    pub fn halves(&mut self) -> (&mut ChannelSender, &mut ChannelReceiver) {
        (&mut self.sender, &mut self.receiver)
    }

    pub fn sender(&mut self) -> &mut ChannelSender {
        &mut self.sender
    }

    pub fn receiver(&mut self) -> &mut ChannelReceiver {
        &mut self.receiver
    }

    /// Close both halves. Idempotent.
    pub fn close(&mut self) {
        self.sender.close();
        self.receiver.close();
    }
}

/// Sending half: tunnel to remote
pub struct ChannelSender {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl ChannelSender {
    /// Send a chunk, waiting for capacity
    pub async fn send(&self, chunk: Bytes) -> Result<(), TransportError> {
        let permit = self.reserve().await?;
        permit.send(chunk);
        Ok(())
    }

    /// Wait for capacity for one chunk
    ///
    /// Cancel-safe: dropping the future before it completes loses nothing.
    pub async fn reserve(&self) -> Result<mpsc::Permit<'_, Bytes>, TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.reserve().await.map_err(|_| TransportError::Closed)
    }

    /// Signal end of data to the remote. Idempotent.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// True once closed locally or by the remote side
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Receiving half: remote to tunnel
pub struct ChannelReceiver {
    rx: mpsc::Receiver<ChannelEvent>,
}

impl ChannelReceiver {
    /// Receive the next event; `None` once the remote has finished sending
    ///
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    /// Stop accepting events. Idempotent.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Transport-side peer of a [`RemoteChannel`]
pub struct RemoteEnd {
    rx: mpsc::Receiver<Bytes>,
    tx: Option<mpsc::Sender<ChannelEvent>>,
}

impl RemoteEnd {
    /// Next chunk sent by the tunnel; `None` once the tunnel closed its send half
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Deliver a chunk to the tunnel
    pub async fn send(&self, chunk: Bytes) -> Result<(), TransportError> {
        self.deliver(ChannelEvent::Data(chunk)).await
    }

    /// Report a network failure to the tunnel and finish the receive half
    pub async fn fail(&mut self, error: TransportError) -> Result<(), TransportError> {
        let result = self.deliver(ChannelEvent::Error(error)).await;
        self.tx = None;
        result
    }

    /// Finish the tunnel's receive half (remote EOF). Idempotent.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Stop accepting chunks from the tunnel. Idempotent.
    pub fn close_inbound(&mut self) {
        self.rx.close();
    }

    /// Split into independently owned halves for separate pump tasks
    pub fn into_split(self) -> (RemoteEndReader, RemoteEndWriter) {
        (
            RemoteEndReader { rx: self.rx },
            RemoteEndWriter { tx: self.tx },
        )
    }

    async fn deliver(&self, event: ChannelEvent) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(event).await.map_err(|_| TransportError::Closed)
    }
}

/// Chunks flowing from the tunnel, owned by one pump task
pub struct RemoteEndReader {
    rx: mpsc::Receiver<Bytes>,
}

impl RemoteEndReader {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Events flowing to the tunnel, owned by one pump task
pub struct RemoteEndWriter {
    tx: Option<mpsc::Sender<ChannelEvent>>,
}

impl RemoteEndWriter {
    pub async fn send(&self, chunk: Bytes) -> Result<(), TransportError> {
        self.deliver(ChannelEvent::Data(chunk)).await
    }

    pub async fn fail(&mut self, error: TransportError) -> Result<(), TransportError> {
        let result = self.deliver(ChannelEvent::Error(error)).await;
        self.tx = None;
        result
    }

    /// Completes once the tunnel dropped or closed its receive half
    ///
    /// Cancel-safe, so pump tasks can race it against a socket read.
    pub async fn closed(&self) {
        if let Some(tx) = &self.tx {
            tx.closed().await;
        }
    }

    async fn deliver(&self, event: ChannelEvent) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(event).await.map_err(|_| TransportError::Closed)
    }
}
