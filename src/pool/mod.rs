//! Worker pool for long-lived tunnel tasks
//!
//! Tunnel sockets live as long as their connections, so their tasks run on a
//! dedicated runtime rather than on whatever runtime the caller uses for
//! short work.

use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Name given to dedicated worker threads
pub const WORKER_THREAD_NAME: &str = "portfwd-worker";

/// Handle to the runtime tunnel tasks are spawned on
///
/// Cheap to clone. A dedicated runtime is shut down in the background when
/// the last clone is dropped.
#[derive(Clone)]
pub struct WorkerPool {
    handle: Handle,
    _runtime: Option<Arc<DedicatedRuntime>>,
}

struct DedicatedRuntime(Option<Runtime>);

impl Drop for DedicatedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            // Safe to call from async context, unlike dropping the runtime
            runtime.shutdown_background();
        }
    }
}

impl WorkerPool {
    /// Build a dedicated multi-threaded runtime with `worker_threads` workers
    pub fn new(worker_threads: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(WORKER_THREAD_NAME)
            .enable_all()
            .build()?;
        debug!(worker_threads, "Worker pool started");

        Ok(Self {
            handle: runtime.handle().clone(),
            _runtime: Some(Arc::new(DedicatedRuntime(Some(runtime)))),
        })
    }

    /// Use the runtime of the calling task
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn current() -> Self {
        Self::from_handle(Handle::current())
    }

    /// Use an existing runtime
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            _runtime: None,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// True when this pool owns its runtime
    pub fn is_dedicated(&self) -> bool {
        self._runtime.is_some()
    }

    /// Spawn a task on the pool
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Spawn a task on the pool, tracked by `tracker`
    pub fn spawn_tracked<F>(&self, tracker: &TaskTracker, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tracker.spawn_on(future, &self.handle)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("dedicated", &self.is_dedicated())
            .finish()
    }
}
