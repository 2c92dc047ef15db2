//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use duplex_rpc::Router;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Close reason sent to every peer on shutdown.
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// What a graceful shutdown did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions closed.
    pub sessions_closed: usize,
    /// Tracked tasks awaited.
    pub tasks: usize,
    /// Whether the grace period ran out and leftovers were aborted.
    pub timed_out: bool,
}

/// Coordinates shutdown of the listener and every task it spawned.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Await `handle` during [`graceful_shutdown`](Self::graceful_shutdown).
    pub fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Tracked tasks still running.
    pub fn tracked(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.is_finished()).count()
    }

    /// Stop accepting, close every session of `router`, then wait up to
    /// `timeout` for tracked tasks. Whatever is still running is aborted.
    pub async fn graceful_shutdown(&self, router: &Router, timeout: Duration) -> ShutdownReport {
        self.shutdown();
        let sessions_closed = router.close_all(SHUTDOWN_REASON).await;

        let handles = std::mem::take(&mut *self.tasks.lock());
        let tasks = handles.len();
        info!(
            sessions_closed,
            task_count = tasks,
            timeout_ms = timeout.as_millis(),
            "waiting for tasks to complete"
        );

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(handles);
        let timed_out = tokio::time::timeout(timeout, drain).await.is_err();
        if timed_out {
            warn!("shutdown timed out after {timeout:?}, aborting remaining tasks");
            for abort in aborts {
                abort.abort();
            }
        }

        ShutdownReport {
            sessions_closed,
            tasks,
            timed_out,
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
