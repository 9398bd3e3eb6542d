//! Integration tests for portfwd
//!
//! Tests the full tunnel flow including:
//! - Accept loop and per-connection remote channels
//! - Byte-stream fidelity and EOF propagation
//! - Failure containment and cancellation

use async_trait::async_trait;
use bytes::Bytes;
use portfwd::transport::{
    channel, DirectTransport, RemoteChannel, RemoteEnd, RemoteTransport, TransportError,
};
use portfwd::tunnel::{ConnectionState, TunnelError};
use portfwd::{
    PortForwardServer, RemoteAddress, ResolvedAddress, TunnelHandle, TunnelOptions, TunnelSpec,
    WorkerPool,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const IO_TIMEOUT: Duration = Duration::from_millis(100);
const WAIT: Duration = Duration::from_secs(2);

/// Transport that hands every opened channel's peer to the test
struct MockTransport {
    failures: AtomicUsize,
    opened: mpsc::UnboundedSender<(RemoteAddress, RemoteEnd)>,
}

impl MockTransport {
    fn new(failures: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<(RemoteAddress, RemoteEnd)>) {
        let (opened, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            failures: AtomicUsize::new(failures),
            opened,
        });
        (transport, rx)
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn open_connection(
        &self,
        remote: &RemoteAddress,
    ) -> Result<RemoteChannel, TransportError> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(TransportError::ConnectionFailed("remote unreachable".into()));
        }

        let (local, end) = channel(16);
        self.opened
            .send((remote.clone(), end))
            .map_err(|_| TransportError::Closed)?;
        Ok(local)
    }
}

fn remote_spec() -> TunnelSpec {
    TunnelSpec::new(0, ResolvedAddress::v4([10, 0, 0, 5], 22))
}

fn fast_options() -> TunnelOptions {
    TunnelOptions::default().with_io_timeout(IO_TIMEOUT)
}

fn start_tunnel<T: RemoteTransport>(
    transport: Arc<T>,
    options: TunnelOptions,
    cancel: &CancellationToken,
) -> TunnelHandle {
    PortForwardServer::new(remote_spec(), transport, WorkerPool::current())
        .with_options(options)
        .start(cancel.clone())
        .expect("tunnel should start")
}

async fn next_end(rx: &mut mpsc::UnboundedReceiver<(RemoteAddress, RemoteEnd)>) -> (RemoteAddress, RemoteEnd) {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no remote channel opened")
        .expect("transport dropped")
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Client sends PING, remote answers PONG
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_pong() {
    let (transport, mut opened) = MockTransport::new(0);
    let cancel = CancellationToken::new();
    let handle = start_tunnel(transport, fast_options(), &cancel);

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    client.write_all(b"PING").await.unwrap();

    let (remote, mut end) = next_end(&mut opened).await;
    assert_eq!(
        remote,
        RemoteAddress::Resolved(ResolvedAddress::v4([10, 0, 0, 5], 22))
    );
    assert_eq!(end.recv().await.unwrap(), Bytes::from_static(b"PING"));
    assert!(tokio::time::timeout(Duration::from_millis(50), end.recv())
        .await
        .is_err());

    end.send(Bytes::from_static(b"PONG")).await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PONG");

    cancel.cancel();
    tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
}

/// Client half-closes without sending anything
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_immediate_half_close() {
    let (transport, mut opened) = MockTransport::new(0);
    let cancel = CancellationToken::new();
    let handle = start_tunnel(transport, fast_options(), &cancel);

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    client.shutdown().await.unwrap();

    let (_, mut end) = next_end(&mut opened).await;
    assert!(end.recv().await.is_none());

    // Remote finishes too; client sees EOF and the connection is released
    end.close();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    wait_until(|| handle.active_connections() == 0).await;
    cancel.cancel();
    tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
}

/// Large transfers arrive intact in both directions
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_fidelity_both_directions() {
    let (transport, mut opened) = MockTransport::new(0);
    let cancel = CancellationToken::new();
    let handle = start_tunnel(transport, fast_options(), &cancel);

    let client = TcpStream::connect(handle.local_addr()).await.unwrap();
    let (mut client_read, mut client_write) = client.into_split();
    let (_, end) = next_end(&mut opened).await;
    let (mut end_read, end_write) = end.into_split();

    let upstream: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let downstream: Vec<u8> = (0..150_000u32).map(|i| (i * 13 % 256) as u8).collect();

    let up = upstream.clone();
    let writer = tokio::spawn(async move {
        client_write.write_all(&up).await.unwrap();
        client_write.shutdown().await.unwrap();
    });

    let collector = tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(chunk) = end_read.recv().await {
            assert!(chunk.len() <= portfwd::DEFAULT_BUFFER_SIZE);
            received.extend_from_slice(&chunk);
        }
        received
    });

    let down = downstream.clone();
    let sender = tokio::spawn(async move {
        for piece in down.chunks(3000) {
            end_write.send(Bytes::copy_from_slice(piece)).await.unwrap();
        }
        // Dropping the writer ends the remote -> local direction
    });

    let mut received_down = Vec::new();
    client_read.read_to_end(&mut received_down).await.unwrap();

    writer.await.unwrap();
    sender.await.unwrap();
    assert_eq!(collector.await.unwrap(), upstream);
    assert_eq!(received_down, downstream);

    cancel.cancel();
    tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
}

/// Two clients on one tunnel never see each other's bytes
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_clients_no_cross_talk() {
    let (transport, mut opened) = MockTransport::new(0);
    let cancel = CancellationToken::new();
    let handle = start_tunnel(transport, fast_options(), &cancel);

    // Connect one at a time so each channel maps to a known client
    let mut client_a = TcpStream::connect(handle.local_addr()).await.unwrap();
    let (_, mut end_a) = next_end(&mut opened).await;
    let mut client_b = TcpStream::connect(handle.local_addr()).await.unwrap();
    let (_, mut end_b) = next_end(&mut opened).await;

    wait_until(|| handle.active_connections() == 2).await;
    let ids: Vec<_> = handle.connections().iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![1, 2]);

    client_b.write_all(b"bravo").await.unwrap();
    client_a.write_all(b"alpha").await.unwrap();

    assert_eq!(end_a.recv().await.unwrap(), Bytes::from_static(b"alpha"));
    assert_eq!(end_b.recv().await.unwrap(), Bytes::from_static(b"bravo"));

    end_a.send(Bytes::from_static(b"to-a")).await.unwrap();
    end_b.send(Bytes::from_static(b"to-b")).await.unwrap();

    let mut buf = [0u8; 4];
    client_a.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"to-a");
    client_b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"to-b");

    // Counters are updated right after each hand-off
    wait_until(|| {
        handle.connections().iter().all(|info| {
            info.state == ConnectionState::Forwarding
                && info.bytes_to_remote == 5
                && info.bytes_to_local == 4
        })
    })
    .await;

    cancel.cancel();
    tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
}

/// A failed remote open closes that client only
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_open_failure_does_not_block_later_connections() {
    let (transport, mut opened) = MockTransport::new(1);
    let cancel = CancellationToken::new();
    let handle = start_tunnel(transport, fast_options(), &cancel);

    let mut rejected = TcpStream::connect(handle.local_addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(WAIT, rejected.read(&mut buf))
        .await
        .expect("rejected client was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    client.write_all(b"PING").await.unwrap();
    let (_, mut end) = next_end(&mut opened).await;
    assert_eq!(end.recv().await.unwrap(), Bytes::from_static(b"PING"));

    cancel.cancel();
    tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
}

/// Cancelling closes the listener and every active connection
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_with_active_connections() {
    let (transport, mut opened) = MockTransport::new(0);
    let cancel = CancellationToken::new();
    let handle = start_tunnel(transport, fast_options(), &cancel);
    let addr = handle.local_addr();

    let mut clients = Vec::new();
    let mut ends = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(addr).await.unwrap());
        ends.push(next_end(&mut opened).await.1);
    }
    wait_until(|| handle.active_connections() == 3).await;

    cancel.cancel();

    // Listener closes right away
    wait_until(|| !handle.is_listening()).await;
    assert!(TcpStream::connect(addr).await.is_err());

    // Every connection closes within one timeout window (plus slack)
    tokio::time::timeout(IO_TIMEOUT * 5, async {
        while handle.active_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connections still open after cancellation");

    for client in &mut clients {
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
    for end in &mut ends {
        assert!(end.recv().await.is_none());
    }

    wait_until(|| handle.is_finished()).await;
    tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
}

/// Shutting one tunnel down leaves a sibling under the same root running
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handle_shutdown_is_scoped_to_tunnel() {
    let (transport, _opened) = MockTransport::new(0);
    let root = CancellationToken::new();
    let first = start_tunnel(Arc::clone(&transport), fast_options(), &root);
    let second = start_tunnel(transport, fast_options(), &root);

    first.shutdown();
    tokio::time::timeout(WAIT, first.wait()).await.unwrap().unwrap();
    assert!(second.is_listening());
    assert!(!root.is_cancelled());

    root.cancel();
    tokio::time::timeout(WAIT, second.wait()).await.unwrap().unwrap();
}

/// A port already in use fails start synchronously
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bind_failure_is_reported() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let (transport, _opened) = MockTransport::new(0);
    let spec = TunnelSpec::new(port, ResolvedAddress::v4([10, 0, 0, 5], 22));
    let result = PortForwardServer::new(spec, transport, WorkerPool::current())
        .with_options(fast_options())
        .start(CancellationToken::new());

    match result {
        Err(TunnelError::Bind { addr, .. }) => assert_eq!(addr.port(), port),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("bind should fail"),
    }
}

/// Connections beyond the limit are closed on accept
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_limit() {
    let (transport, mut opened) = MockTransport::new(0);
    let cancel = CancellationToken::new();
    let options = TunnelOptions {
        max_connections: Some(1),
        ..fast_options()
    };
    let handle = start_tunnel(transport, options, &cancel);

    let _first = TcpStream::connect(handle.local_addr()).await.unwrap();
    let (_, _end) = next_end(&mut opened).await;

    let mut second = TcpStream::connect(handle.local_addr()).await.unwrap();
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(WAIT, second.read(&mut buf))
        .await
        .expect("over-limit client was not closed")
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert_eq!(handle.active_connections(), 1);

    cancel.cancel();
    tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
}

/// Full path through the direct TCP transport to a real echo server
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_direct_transport_end_to_end() {
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr: SocketAddr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = echo.accept().await.unwrap();
        let (mut r, mut w) = socket.split();
        tokio::io::copy(&mut r, &mut w).await.unwrap();
    });

    let cancel = CancellationToken::new();
    let handle = PortForwardServer::new(
        TunnelSpec::new(0, echo_addr),
        Arc::new(DirectTransport::new_default()),
        WorkerPool::current(),
    )
    .with_options(fast_options())
    .start(cancel.clone())
    .unwrap();

    let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
    let message = b"Hello through the tunnel!";
    client.write_all(message).await.unwrap();
    client.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    tokio::time::timeout(WAIT, client.read_to_end(&mut echoed))
        .await
        .expect("echo did not finish")
        .unwrap();
    assert_eq!(echoed, message);

    wait_until(|| handle.active_connections() == 0).await;
    cancel.cancel();
    tokio::time::timeout(WAIT, handle.wait()).await.unwrap().unwrap();
}
