//! Request worker pool and its two-phase shutdown
//!
//! Application handlers do not run on the connection tasks directly: the
//! dispatch layer hands each request to a [`WorkerPool`] and waits for the
//! response. That gives the server one place to bound concurrency, to observe
//! load ([`PoolIntrospection`]) and to cancel outstanding work when a graceful
//! shutdown runs out of time ([`WorkerPoolController::shutdown`]).

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio::task::AbortHandle;

use crate::error::PoolError;

/// Unit of work executed by a pool
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Read-only view of a pool's sizing and load
///
/// Values are sampled independently of each other, so a snapshot taken under
/// load may be momentarily inconsistent.
pub trait PoolIntrospection: Send + Sync {
    /// Workers kept alive while idle
    fn core_pool_size(&self) -> usize;
    /// Upper bound on workers
    fn max_pool_size(&self) -> usize;
    /// Workers currently running a job
    fn active_count(&self) -> usize;
    /// Jobs submitted but not yet picked up
    fn queue_depth(&self) -> usize;
}

/// Executor for request-handling work
#[async_trait]
pub trait WorkerPool: Send + Sync + fmt::Debug {
    /// Pool name, used in logs and errors
    fn name(&self) -> &str;

    /// Queue a job
    fn submit(&self, job: Job) -> Result<(), PoolError>;

    /// Stop accepting jobs; queued and running jobs still complete
    fn shutdown(&self);

    /// Whether [`shutdown`](Self::shutdown) has been called
    fn is_shutdown(&self) -> bool;

    /// Wait until the pool is shut down and every worker has exited
    async fn await_termination(&self, timeout: Duration) -> bool;

    /// Cancel running jobs and drop queued ones, returning how many were dropped
    fn shutdown_now(&self) -> usize;

    /// Introspection capability, if the pool has one
    fn introspection(&self) -> Option<&dyn PoolIntrospection> {
        None
    }
}

/// Sizing for [`TaskPool`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPoolConfig {
    /// Pool name
    pub name: String,
    /// Workers spawned up front and never retired
    pub core_size: usize,
    /// Upper bound on workers
    pub max_size: usize,
    /// Idle time after which workers above `core_size` exit
    pub keep_alive: Duration,
}

impl TaskPoolConfig {
    /// Fixed-size pool of `threads` workers
    pub fn fixed(name: impl Into<String>, threads: usize, keep_alive: Duration) -> Self {
        Self {
            name: name.into(),
            core_size: threads,
            max_size: threads,
            keep_alive,
        }
    }
}

/// Worker pool running jobs on tokio tasks fed by a shared queue
///
/// `core_size` workers start immediately. When jobs queue up faster than idle
/// workers pick them up, extra workers are spawned up to `max_size`; those
/// retire after `keep_alive` without work.
pub struct TaskPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    core_size: usize,
    max_size: usize,
    keep_alive: Duration,
    runtime: Handle,
    sender: Mutex<Option<flume::Sender<Job>>>,
    receiver: flume::Receiver<Job>,
    workers: Mutex<Vec<AbortHandle>>,
    live: AtomicUsize,
    active: AtomicUsize,
    shutdown: AtomicBool,
    terminated: Notify,
}

impl TaskPool {
    /// Create a pool and spawn its core workers on the current runtime
    pub fn new(config: TaskPoolConfig) -> Result<Self, PoolError> {
        if config.max_size == 0 {
            return Err(PoolError::InvalidSizing(format!(
                "pool {} needs at least one worker",
                config.name
            )));
        }
        if config.core_size > config.max_size {
            return Err(PoolError::InvalidSizing(format!(
                "core size {} exceeds max size {}",
                config.core_size, config.max_size
            )));
        }
        let runtime = Handle::try_current().map_err(|_| PoolError::NoRuntime {
            name: config.name.clone(),
        })?;

        let (sender, receiver) = flume::unbounded();
        let inner = Arc::new(PoolInner {
            name: config.name,
            core_size: config.core_size,
            max_size: config.max_size,
            keep_alive: config.keep_alive,
            runtime,
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(Vec::with_capacity(config.max_size)),
            live: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            terminated: Notify::new(),
        });

        for _ in 0..inner.core_size {
            inner.live.fetch_add(1, Ordering::AcqRel);
            inner.spawn_worker(true);
        }
        tracing::debug!(
            pool = %inner.name,
            core_size = inner.core_size,
            max_size = inner.max_size,
            "Worker pool started"
        );

        Ok(Self { inner })
    }

    /// Workers currently alive
    pub fn live_workers(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        // Workers hold the inner state; closing the queue lets them exit.
        self.inner.sender.lock().take();
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("name", &self.inner.name)
            .field("core_size", &self.inner.core_size)
            .field("max_size", &self.inner.max_size)
            .field("live", &self.inner.live.load(Ordering::Relaxed))
            .field("active", &self.inner.active.load(Ordering::Relaxed))
            .field("shutdown", &self.inner.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl PoolInner {
    /// Spawn a worker; the caller has already counted it in `live`
    fn spawn_worker(self: &Arc<Self>, core: bool) {
        let handle = self.runtime.spawn(run_worker(Arc::clone(self), core));
        let mut workers = self.workers.lock();
        workers.retain(|worker| !worker.is_finished());
        workers.push(handle.abort_handle());
    }

    fn maybe_grow(self: &Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let live = self.live.load(Ordering::Acquire);
            let idle = live.saturating_sub(self.active.load(Ordering::Acquire));
            if live >= self.max_size || self.receiver.len() <= idle {
                return;
            }
            if self
                .live
                .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::trace!(pool = %self.name, workers = live + 1, "Growing worker pool");
                self.spawn_worker(false);
                return;
            }
        }
    }
}

/// Decrements `live` when a worker exits or is aborted
struct LiveGuard<'a>(&'a PoolInner);

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        if self.0.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.terminated.notify_waiters();
        }
    }
}

struct BusyGuard<'a>(&'a AtomicUsize);

impl<'a> BusyGuard<'a> {
    fn enter(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self(active)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn run_worker(pool: Arc<PoolInner>, core: bool) {
    let _live = LiveGuard(&pool);
    loop {
        let next = if core {
            pool.receiver.recv_async().await.ok()
        } else {
            match tokio::time::timeout(pool.keep_alive, pool.receiver.recv_async()).await {
                Ok(job) => job.ok(),
                Err(_) => {
                    tracing::trace!(pool = %pool.name, "Idle worker retiring");
                    None
                }
            }
        };
        // None once retired, or once the queue is closed and drained.
        let Some(job) = next else { break };

        let _busy = BusyGuard::enter(&pool.active);
        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            tracing::error!(pool = %pool.name, "Job panicked; worker continues");
        }
    }
}

#[async_trait]
impl WorkerPool for TaskPool {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn submit(&self, job: Job) -> Result<(), PoolError> {
        {
            let sender = self.inner.sender.lock();
            let sender = sender
                .as_ref()
                .ok_or_else(|| PoolError::rejected(&self.inner.name))?;
            sender
                .send(job)
                .map_err(|_| PoolError::rejected(&self.inner.name))?;
        }
        self.inner.maybe_grow();
        Ok(())
    }

    fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        // Dropping the only sender lets workers finish the queue and exit.
        if self.inner.sender.lock().take().is_some() {
            tracing::debug!(pool = %self.inner.name, "Worker pool stopped accepting jobs");
        }
    }

    fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    async fn await_termination(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        let terminated = async {
            loop {
                let notified = inner.terminated.notified();
                if inner.shutdown.load(Ordering::Acquire) && inner.live.load(Ordering::Acquire) == 0
                {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, terminated).await.is_ok()
    }

    fn shutdown_now(&self) -> usize {
        self.shutdown();
        for worker in self.inner.workers.lock().drain(..) {
            worker.abort();
        }
        self.inner.receiver.drain().count()
    }

    fn introspection(&self) -> Option<&dyn PoolIntrospection> {
        Some(self)
    }
}

impl PoolIntrospection for TaskPool {
    fn core_pool_size(&self) -> usize {
        self.inner.core_size
    }

    fn max_pool_size(&self) -> usize {
        self.inner.max_size
    }

    fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    fn queue_depth(&self) -> usize {
        self.inner.receiver.len()
    }
}

/// How a pool shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolShutdown {
    /// Every queued and running job completed in time
    Graceful,
    /// The termination timeout elapsed and remaining work was cancelled
    Forced {
        /// Queued jobs that never started
        dropped: usize,
    },
}

/// Owns the request pool and shuts it down in two phases
#[derive(Debug, Clone)]
pub struct WorkerPoolController {
    pool: Arc<dyn WorkerPool>,
}

impl WorkerPoolController {
    /// Wrap a pool
    pub fn new(pool: Arc<dyn WorkerPool>) -> Self {
        Self { pool }
    }

    /// The controlled pool
    pub fn pool(&self) -> &Arc<dyn WorkerPool> {
        &self.pool
    }

    /// Stop the pool, waiting at most `termination_timeout` before cancelling
    ///
    /// Never waits longer than the timeout: jobs still running afterwards are
    /// aborted at their next suspension point and not awaited.
    pub async fn shutdown(&self, termination_timeout: Duration) -> PoolShutdown {
        self.pool.shutdown();
        if self.pool.await_termination(termination_timeout).await {
            tracing::info!(pool = self.pool.name(), "Worker pool terminated");
            return PoolShutdown::Graceful;
        }

        let dropped = self.pool.shutdown_now();
        tracing::warn!(
            pool = self.pool.name(),
            timeout_ms = termination_timeout.as_millis() as u64,
            dropped,
            "Worker pool did not terminate in time; cancelled remaining jobs"
        );
        PoolShutdown::Forced { dropped }
    }
}

/// Middleware running the rest of the chain on the worker pool
pub(crate) async fn dispatch_layer(
    State(pool): State<Arc<dyn WorkerPool>>,
    request: Request,
    next: Next,
) -> Response {
    let (tx, rx) = oneshot::channel();
    let job: Job = Box::pin(async move {
        let response = next.run(request).await;
        let _ = tx.send(response);
    });

    if let Err(e) = pool.submit(job) {
        tracing::debug!(error = %e, "Request rejected by worker pool");
        return (StatusCode::SERVICE_UNAVAILABLE, "Worker pool is shut down").into_response();
    }

    // The sender is dropped without a value when the job is cancelled.
    rx.await.unwrap_or_else(|_| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "Request cancelled during shutdown",
        )
            .into_response()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_inconsistent_sizing() {
        let config = TaskPoolConfig {
            name: "bad".into(),
            core_size: 4,
            max_size: 2,
            keep_alive: Duration::from_secs(1),
        };
        assert!(matches!(
            TaskPool::new(config),
            Err(PoolError::InvalidSizing(_))
        ));
    }

    #[test]
    fn needs_a_runtime() {
        let config = TaskPoolConfig::fixed("orphan", 1, Duration::from_secs(1));
        assert!(matches!(
            TaskPool::new(config),
            Err(PoolError::NoRuntime { .. })
        ));
    }

    #[tokio::test]
    async fn survives_panicking_job() {
        let pool = TaskPool::new(TaskPoolConfig::fixed("panics", 1, Duration::from_secs(1))).unwrap();
        pool.submit(Box::pin(async { panic!("boom") })).unwrap();

        let (tx, rx) = oneshot::channel();
        pool.submit(Box::pin(async move {
            let _ = tx.send(42);
        }))
        .unwrap();

        assert_eq!(rx.await.unwrap(), 42);
        assert_eq!(pool.live_workers(), 1);
    }

    #[tokio::test]
    async fn grows_up_to_max_and_retires_extras() {
        let config = TaskPoolConfig {
            name: "elastic".into(),
            core_size: 1,
            max_size: 3,
            keep_alive: Duration::from_millis(50),
        };
        let pool = TaskPool::new(config).unwrap();
        let release = Arc::new(Notify::new());

        let mut done = Vec::new();
        for _ in 0..3 {
            let release = Arc::clone(&release);
            let (tx, rx) = oneshot::channel::<()>();
            done.push(rx);
            pool.submit(Box::pin(async move {
                release.notified().await;
                let _ = tx.send(());
            }))
            .unwrap();
            tokio::task::yield_now().await;
        }

        assert!(pool.live_workers() <= 3);
        while pool.active_count() < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.live_workers(), 3);

        release.notify_waiters();
        for rx in done {
            rx.await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.live_workers(), 1);
    }
}
