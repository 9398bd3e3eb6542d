//! Local listener and accept loop of one tunnel

use super::bridge::ConnectionBridge;
use super::connection::{Connection, ConnectionInfo, ConnectionRegistry, ConnectionState};
use super::{TunnelError, TunnelOptions, TunnelSpec};
use crate::pool::WorkerPool;
use crate::transport::RemoteTransport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Pause after an accept error so a persistent failure (e.g. fd exhaustion) does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Port-forwarding server for one [`TunnelSpec`]
pub struct PortForwardServer<T: RemoteTransport> {
    spec: TunnelSpec,
    transport: Arc<T>,
    pool: WorkerPool,
    options: TunnelOptions,
}

impl<T: RemoteTransport> PortForwardServer<T> {
    pub fn new(spec: TunnelSpec, transport: Arc<T>, pool: WorkerPool) -> Self {
        Self {
            spec,
            transport,
            pool,
            options: TunnelOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TunnelOptions) -> Self {
        self.options = options;
        self
    }

    /// Bind the listener and start accepting on the worker pool
    ///
    /// Returns once the socket is listening. A bind failure is returned here,
    /// before any accept loop runs. The tunnel lives until `cancel` (or the
    /// returned handle) is cancelled.
    pub fn start(self, cancel: CancellationToken) -> Result<TunnelHandle, TunnelError> {
        let bind_addr = SocketAddr::new(self.options.bind_host, self.spec.local_port);
        let listener = self.bind(bind_addr)?;
        let local_addr = listener.local_addr()?;

        info!(
            %local_addr,
            remote = %self.spec.remote,
            "Tunnel listening"
        );

        let cancel = cancel.child_token();
        let limiter = self
            .options
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));
        let shared = Arc::new(Shared {
            spec: self.spec,
            transport: self.transport,
            pool: self.pool,
            options: self.options,
            registry: Arc::new(ConnectionRegistry::new()),
            tracker: TaskTracker::new(),
            limiter,
            local_addr,
        });

        let accept_task = shared
            .pool
            .spawn(Arc::clone(&shared).accept_loop(listener, cancel.clone()));

        Ok(TunnelHandle {
            shared,
            cancel,
            accept_task,
        })
    }

    fn bind(&self, addr: SocketAddr) -> Result<TcpListener, TunnelError> {
        let bind_error = |source| TunnelError::Bind { addr, source };

        // Register the listener with the pool's reactor
        let _guard = self.pool.handle().enter();

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_error)?;

        #[cfg(not(windows))]
        socket.set_reuseaddr(true).map_err(bind_error)?;

        socket.bind(addr).map_err(bind_error)?;
        socket.listen(self.options.backlog).map_err(bind_error)
    }
}

/// State shared by the accept loop and connection tasks
struct Shared<T: RemoteTransport> {
    spec: TunnelSpec,
    transport: Arc<T>,
    pool: WorkerPool,
    options: TunnelOptions,
    registry: Arc<ConnectionRegistry>,
    tracker: TaskTracker,
    limiter: Option<Arc<Semaphore>>,
    local_addr: SocketAddr,
}

impl<T: RemoteTransport> Shared<T> {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = timeout(self.options.accept_timeout, listener.accept()) => result,
            };

            match accepted {
                Err(_) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                }
                Ok(Ok((stream, peer))) => self.dispatch(stream, peer, &cancel),
                Ok(Err(e)) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(local_addr = %self.local_addr, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        drop(listener);
        self.tracker.close();
        info!(
            local_addr = %self.local_addr,
            active = self.registry.len(),
            "Tunnel listener closed"
        );
    }

    fn dispatch(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, cancel: &CancellationToken) {
        let permit = match &self.limiter {
            Some(limiter) => match Arc::clone(limiter).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(
                        %peer,
                        limit = ?self.options.max_connections,
                        "Connection limit reached, rejecting"
                    );
                    return;
                }
            },
            None => None,
        };

        stream.set_nodelay(true).ok();
        let connection = Connection::accept(&self.registry, stream, peer);
        debug!(connection_id = connection.id(), %peer, "Accepted local connection");

        let shared = Arc::clone(self);
        let cancel = cancel.child_token();
        self.pool.spawn_tracked(&self.tracker, async move {
            let _permit = permit;
            shared.serve(connection, cancel).await;
        });
    }

    async fn serve(&self, mut connection: Connection, cancel: CancellationToken) {
        let id = connection.id();

        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(connection_id = id, "Cancelled before remote channel opened");
                connection.close().await;
                return;
            }
            result = self.transport.open_connection(&self.spec.remote) => result,
        };

        let mut channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                error!(
                    connection_id = id,
                    remote = %self.spec.remote,
                    error = %e,
                    "Failed to open remote channel"
                );
                connection.close().await;
                return;
            }
        };

        connection.set_state(ConnectionState::Forwarding);
        let bridge = ConnectionBridge::new(id, cancel, self.options.bridge_config());
        let report = bridge.run(&mut connection, &mut channel).await;

        channel.close();
        connection.close().await;

        info!(
            connection_id = id,
            peer = %connection.peer(),
            bytes_to_remote = report.bytes_to_remote,
            bytes_to_local = report.bytes_to_local,
            "Connection closed"
        );
    }
}

/// Handle to a running tunnel
pub struct TunnelHandle {
    shared: Arc<dyn TunnelView>,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Transport-independent view of the shared state
trait TunnelView: Send + Sync {
    fn spec(&self) -> &TunnelSpec;
    fn local_addr(&self) -> SocketAddr;
    fn registry(&self) -> &ConnectionRegistry;
    fn tracker(&self) -> &TaskTracker;
}

impl<T: RemoteTransport> TunnelView for Shared<T> {
    fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }
}

impl TunnelHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr()
    }

    pub fn spec(&self) -> &TunnelSpec {
        self.shared.spec()
    }

    /// Number of connections not yet closed
    pub fn active_connections(&self) -> usize {
        self.shared.registry().len()
    }

    /// Snapshot of live connections, ordered by id
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared.registry().snapshot()
    }

    /// Token governing this tunnel
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop accepting and cancel all connections. Does not wait.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// True while the accept loop runs
    pub fn is_listening(&self) -> bool {
        !self.accept_task.is_finished()
    }

    /// True once the accept loop and every connection task have finished
    pub fn is_finished(&self) -> bool {
        self.accept_task.is_finished() && self.shared.tracker().is_empty()
    }

    /// Wait for the accept loop, then for every connection task
    pub async fn wait(self) -> Result<(), TunnelError> {
        let accept_result = self.accept_task.await;

        let tracker = self.shared.tracker();
        tracker.close();
        tracker.wait().await;

        debug!(local_addr = %self.shared.local_addr(), "Tunnel finished");
        accept_result.map_err(|e| TunnelError::Task(e.to_string()))
    }
}
