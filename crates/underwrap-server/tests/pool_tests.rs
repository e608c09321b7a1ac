//! Tests for the worker pool and its two-phase shutdown


use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use test_helpers::OpaquePool;
use tokio::sync::{Notify, oneshot};
use underwrap_server::{
    MetricsError, MetricsSnapshot, PoolError, PoolIntrospection, PoolShutdown, TaskPool,
    TaskPoolConfig, WorkerPool, WorkerPoolController,
};

fn fixed_pool(threads: usize) -> Arc<TaskPool> {
    Arc::new(TaskPool::new(TaskPoolConfig::fixed("test", threads, Duration::from_secs(60))).unwrap())
}

#[tokio::test]
async fn test_metrics_reflect_sizing_and_load() {
    let pool = fixed_pool(4);
    let release = Arc::new(Notify::new());
    let started = Arc::new(AtomicUsize::new(0));

    let mut done = Vec::new();
    for _ in 0..6 {
        let release = Arc::clone(&release);
        let started = Arc::clone(&started);
        let (tx, rx) = oneshot::channel::<()>();
        done.push(rx);
        pool.submit(Box::pin(async move {
            let notified = release.notified();
            started.fetch_add(1, Ordering::SeqCst);
            notified.await;
            let _ = tx.send(());
        }))
        .unwrap();
    }

    while started.load(Ordering::SeqCst) < 4 {
        tokio::task::yield_now().await;
    }
    let snapshot = MetricsSnapshot::capture(pool.as_ref()).unwrap();
    assert_eq!(
        snapshot,
        MetricsSnapshot {
            core_pool_size: 4,
            max_pool_size: 4,
            active_count: 4,
            queued_tasks: 2,
        }
    );
    assert!(snapshot.is_saturated());

    // Keep waking until every job, including the queued ones, has finished.
    for rx in done {
        let mut rx = rx;
        loop {
            release.notify_waiters();
            match tokio::time::timeout(Duration::from_millis(10), &mut rx).await {
                Ok(result) => {
                    result.unwrap();
                    break;
                }
                Err(_) => continue,
            }
        }
    }

    while pool.active_count() > 0 {
        tokio::task::yield_now().await;
    }
    let idle = MetricsSnapshot::capture(pool.as_ref()).unwrap();
    assert_eq!(idle.active_count, 0);
    assert_eq!(idle.queued_tasks, 0);
    assert!(idle.active_count < 4);
}

#[tokio::test]
async fn test_graceful_shutdown_finishes_queued_jobs() {
    let pool = fixed_pool(2);
    let completed = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let completed = Arc::clone(&completed);
        pool.submit(Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            completed.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    }

    let controller = WorkerPoolController::new(pool.clone());
    let outcome = controller.shutdown(Duration::from_secs(5)).await;

    assert_eq!(outcome, PoolShutdown::Graceful);
    assert_eq!(completed.load(Ordering::SeqCst), 10);
    assert_eq!(pool.live_workers(), 0);
}

#[tokio::test]
async fn test_submit_after_shutdown_is_rejected() {
    let pool = fixed_pool(1);
    pool.shutdown();

    let err = pool.submit(Box::pin(async {})).unwrap_err();
    assert_eq!(err, PoolError::rejected("test"));
    assert!(pool.is_shutdown());
}

#[tokio::test(start_paused = true)]
async fn test_forced_shutdown_is_bounded() {
    let pool = fixed_pool(2);
    for _ in 0..5 {
        pool.submit(Box::pin(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }))
        .unwrap();
    }
    while pool.active_count() < 2 {
        tokio::task::yield_now().await;
    }

    let started = tokio::time::Instant::now();
    let controller = WorkerPoolController::new(pool.clone());
    let outcome = controller.shutdown(Duration::from_secs(1)).await;

    assert_eq!(started.elapsed(), Duration::from_secs(1));
    assert_eq!(outcome, PoolShutdown::Forced { dropped: 3 });
    assert!(pool.await_termination(Duration::from_secs(1)).await);
}

#[test]
fn test_metrics_without_introspection() {
    assert_eq!(
        MetricsSnapshot::capture(&OpaquePool),
        Err(MetricsError::IntrospectionUnavailable {
            pool: "opaque".into()
        })
    );
}
