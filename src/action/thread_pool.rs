//! Worker pool for actions run asynchronously.
//!
//! Actions only need fire-and-forget submission: whatever a task produces is written into
//! the shared state of the command or sequence it belongs to, and the claim on the
//! resource is released when the task drops its busy guard.
//!
//! - [`TokioThreadPool`] runs tasks on the blocking pool of its own Tokio runtime, since
//!   action code blocks on hardware I/O.
//! - [`InlineThreadPool`] runs tasks on the submitting thread.
//! - [`shared`] is the process-wide pool used by resources that were not given one.

use crate::error::{ActionError, ActionResult};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

/// Unit of work accepted by a pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Default number of workers of the shared pool.
pub const DEFAULT_WORKERS: usize = 4;

/// Default time granted to running tasks when a pool is dropped.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Asynchronous executor for action tasks.
pub trait ThreadPool: Send + Sync {
    /// Schedule `task`. Returns once the task is queued, not when it has run.
    fn submit(&self, task: Task) -> ActionResult<()>;
}

fn run_logged(task: Task) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        tracing::error!("Thread pool task panicked: {}", message);
    }
}

// =============================================================================
// Tokio-backed pool
// =============================================================================

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the pool owning the current thread, 0 outside any pool.
    static CURRENT_POOL: Cell<u64> = const { Cell::new(0) };
}

/// Pool running tasks on a dedicated Tokio runtime.
#[derive(Debug)]
pub struct TokioThreadPool {
    id: u64,
    workers: usize,
    shutdown_timeout: Duration,
    runtime: Mutex<Option<Runtime>>,
}

impl TokioThreadPool {
    /// Pool with `workers` threads (at least 2).
    pub fn new(workers: usize) -> ActionResult<Self> {
        if workers < 2 {
            return Err(ActionError::InvalidArgument(format!(
                "Thread pool needs at least 2 workers, got {}",
                workers
            )));
        }
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(workers)
            .thread_name("swatch-action")
            .on_thread_start(move || CURRENT_POOL.with(|current| current.set(id)))
            .enable_all()
            .build()?;
        tracing::debug!("Started thread pool with {} workers", workers);
        Ok(Self {
            id,
            workers,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Time granted to running tasks when the pool is dropped.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.runtime.lock().is_none()
    }

    /// Whether the calling thread is one of this pool's workers.
    pub fn is_pool_thread(&self) -> bool {
        CURRENT_POOL.with(|current| current.get() == self.id)
    }

    /// Refuse further tasks and wait up to `timeout` for running ones.
    ///
    /// Called from one of the pool's own tasks, returns without waiting: the
    /// caller's task would otherwise be among those waited for.
    pub fn stop(&self, timeout: Duration) {
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            tracing::info!("Stopping thread pool ({} workers)", self.workers);
            if self.is_pool_thread() {
                tracing::debug!("Thread pool stopped from its own worker, not waiting for tasks");
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(timeout);
            }
        }
    }
}

impl Drop for TokioThreadPool {
    fn drop(&mut self) {
        self.stop(self.shutdown_timeout);
    }
}

impl ThreadPool for TokioThreadPool {
    fn submit(&self, task: Task) -> ActionResult<()> {
        let runtime = self.runtime.lock();
        match runtime.as_ref() {
            Some(runtime) => {
                runtime.spawn_blocking(move || run_logged(task));
                Ok(())
            }
            None => Err(ActionError::OperationOnStoppedThreadPool(
                "Cannot submit task: thread pool has been stopped".to_string(),
            )),
        }
    }
}

// =============================================================================
// Inline pool
// =============================================================================

/// Pool that runs every task immediately on the caller's thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineThreadPool;

impl ThreadPool for InlineThreadPool {
    fn submit(&self, task: Task) -> ActionResult<()> {
        run_logged(task);
        Ok(())
    }
}

// =============================================================================
// Shared pool
// =============================================================================

static SHARED: OnceCell<Arc<dyn ThreadPool>> = OnceCell::new();

/// Process-wide default pool, created on first use.
///
/// Falls back to running tasks inline if the runtime cannot be started.
pub fn shared() -> Arc<dyn ThreadPool> {
    Arc::clone(SHARED.get_or_init(|| match TokioThreadPool::new(DEFAULT_WORKERS) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            tracing::error!("Failed to start shared thread pool, running tasks inline: {}", e);
            Arc::new(InlineThreadPool)
        }
    }))
}

/// Install `pool` as the process-wide default. Fails if the default is already in use.
pub fn set_shared(pool: Arc<dyn ThreadPool>) -> ActionResult<()> {
    SHARED.set(pool).map_err(|_| {
        ActionError::Runtime("Shared thread pool already initialised".to_string())
    })
}
