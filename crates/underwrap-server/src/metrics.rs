//! Worker pool metrics
//!
//! A [`MetricsSnapshot`] is read straight from the live pool. The four values
//! are sampled one after another without a lock, so under load they describe
//! slightly different instants: treat them as approximate, never as a
//! transactional view.

use serde::{Deserialize, Serialize};

use crate::error::MetricsError;
use crate::pool::WorkerPool;

/// Point-in-time view of worker pool sizing and load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Workers kept alive while idle
    pub core_pool_size: usize,
    /// Upper bound on workers
    pub max_pool_size: usize,
    /// Workers currently running a request
    pub active_count: usize,
    /// Requests waiting for a worker
    pub queued_tasks: usize,
}

impl MetricsSnapshot {
    /// Sample `pool` without mutating it
    pub fn capture(pool: &dyn WorkerPool) -> Result<Self, MetricsError> {
        let view = pool
            .introspection()
            .ok_or_else(|| MetricsError::IntrospectionUnavailable {
                pool: pool.name().to_owned(),
            })?;

        Ok(Self {
            core_pool_size: view.core_pool_size(),
            max_pool_size: view.max_pool_size(),
            active_count: view.active_count(),
            queued_tasks: view.queue_depth(),
        })
    }

    /// Fraction of the maximum pool size that is busy, in `0.0..=1.0`
    pub fn utilization(&self) -> f64 {
        if self.max_pool_size == 0 {
            return 0.0;
        }
        (self.active_count as f64 / self.max_pool_size as f64).min(1.0)
    }

    /// Every worker is busy and requests are queueing
    pub fn is_saturated(&self) -> bool {
        self.active_count >= self.max_pool_size && self.queued_tasks > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_is_bounded() {
        let snapshot = MetricsSnapshot {
            core_pool_size: 4,
            max_pool_size: 4,
            active_count: 6,
            queued_tasks: 3,
        };
        assert!((snapshot.utilization() - 1.0).abs() < f64::EPSILON);
        assert!(snapshot.is_saturated());
        assert!(MetricsSnapshot::default().utilization().abs() < f64::EPSILON);
    }
}
