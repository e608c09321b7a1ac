//! Fixed-delay retry and the dispatch container teardown built on it

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::container::{ContainerState, DispatchContainer};
use crate::error::ContainerError;

/// Retry policy: which errors to retry, how long to wait between attempts and
/// how many attempts to make in total
pub struct RetryPolicy<E> {
    retry_on: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    delay: Duration,
    max_attempts: u32,
}

impl<E> RetryPolicy<E> {
    /// Retry every error, waiting `delay` between at most `max_attempts` attempts
    ///
    /// `max_attempts` is clamped to at least one.
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            retry_on: Arc::new(|_| true),
            delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Only retry errors matching `predicate`
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(predicate);
        self
    }

    /// Delay between attempts
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Total attempts, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Time spent sleeping if every attempt fails
    pub fn max_elapsed(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }

    fn should_retry(&self, error: &E) -> bool {
        (self.retry_on)(error)
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            retry_on: Arc::clone(&self.retry_on),
            delay: self.delay,
            max_attempts: self.max_attempts,
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("delay", &self.delay)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Why a retried operation gave up
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the last attempt
        last: E,
    },

    /// An attempt failed with an error the policy does not retry
    #[error("Attempt {attempt} failed: {error}")]
    Rejected {
        /// Attempt that failed, starting at 1
        attempt: u32,
        /// The error
        error: E,
    },
}

/// Run `operation` until it succeeds or the policy gives up
///
/// The closure receives the attempt number starting at 1. The delay is slept
/// between attempts and never after the last one.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy<E>, mut operation: F) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if !policy.should_retry(&error) => {
                return Err(RetryError::Rejected { attempt, error });
            }
            Err(last) if attempt >= policy.max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last,
                });
            }
            Err(error) => {
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %error,
                    "Operation failed, retrying"
                );
                sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

/// Stops and undeploys the dispatch container, retrying while it is busy
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryingTeardown;

impl RetryingTeardown {
    /// Policy retrying only [`ContainerError::is_retryable`] errors
    pub fn policy(delay: Duration, max_attempts: u32) -> RetryPolicy<ContainerError> {
        RetryPolicy::new(delay, max_attempts).retry_on(ContainerError::is_retryable)
    }

    /// Stop then undeploy `container`
    ///
    /// Returns the number of attempts the stop needed. The undeploy step runs
    /// under the same policy and only once the stop has succeeded.
    pub async fn stop(
        container: &dyn DispatchContainer,
        policy: &RetryPolicy<ContainerError>,
    ) -> Result<u32, RetryError<ContainerError>> {
        let name = container.name().to_owned();
        let mut attempts = 0;

        retry(policy, |attempt| {
            attempts = attempt;
            let state = container.state();
            tracing::info!(container = %name, %state, attempt, "Stopping dispatch container");
            async move {
                if state == ContainerState::Started {
                    container.stop()
                } else {
                    Ok(())
                }
            }
        })
        .await?;

        if container.state() != ContainerState::Undeployed {
            retry(policy, |attempt| {
                tracing::debug!(container = %name, attempt, "Undeploying dispatch container");
                async move { container.undeploy() }
            })
            .await?;
        }

        tracing::info!(container = %name, attempts, "Dispatch container torn down");
        Ok(attempts)
    }
}
