//! Graceful drain gate with in-flight request tracking
//!
//! The gate sits in front of the handler chain. While open it counts every
//! admitted request; once [`DrainGate::signal_shutdown`] has been called new
//! requests are answered with `503 Service Unavailable` and
//! [`DrainGate::await_drain`] lets the coordinator wait for the requests that
//! were already admitted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::sync::Notify;

/// Admission flag plus in-flight counter
///
/// Every successful [`admit`](Self::admit) must be paired with exactly one
/// [`release`](Self::release); [`enter`](Self::enter) returns a guard that
/// does the pairing on drop, including when the request future is cancelled.
#[derive(Debug, Default)]
pub struct DrainGate {
    closed: AtomicBool,
    in_flight: AtomicU64,
    admitted: AtomicU64,
    rejected: AtomicU64,
    drained: Notify,
}

impl DrainGate {
    /// Create an open gate
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to admit a request
    ///
    /// Returns `false` once shutdown has been signalled. The flag is checked
    /// again after incrementing so a request racing `signal_shutdown` is either
    /// visible to `await_drain` or rejected, never lost.
    pub fn admit(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.release();
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.admitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Mark an admitted request as finished
    ///
    /// Releasing more often than admitting is a bug in the caller: debug
    /// builds panic, release builds log it and keep the counter at zero.
    pub fn release(&self) {
        let released = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        debug_assert!(released.is_ok(), "drain gate released with no request in flight");
        match released {
            Ok(1) => self.drained.notify_waiters(),
            Ok(_) => {}
            Err(_) => tracing::warn!("Drain gate released with no request in flight"),
        }
    }

    /// Admit a request and return a guard releasing it on drop
    #[must_use]
    pub fn enter(&self) -> Option<DrainGuard<'_>> {
        if self.admit() {
            Some(DrainGuard { gate: self })
        } else {
            None
        }
    }

    /// Stop admitting requests; idempotent
    pub fn signal_shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!(
                in_flight = self.in_flight(),
                "Drain gate closed to new requests"
            );
        }
    }

    /// Wait until no request is in flight or `timeout` elapses
    ///
    /// Returns whether the gate drained.
    pub async fn await_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                // Registered before the check: a release between the check and
                // the await still wakes us.
                let notified = self.drained.notified();
                if self.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    /// Whether shutdown has been signalled
    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Requests currently admitted and not yet released
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Total requests admitted since creation
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Total requests turned away
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Releases its request on drop
#[derive(Debug)]
pub struct DrainGuard<'a> {
    gate: &'a DrainGate,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Middleware admitting requests through the gate
pub(crate) async fn drain_layer(
    State(gate): State<Arc<DrainGate>>,
    request: Request,
    next: Next,
) -> Response {
    match gate.enter() {
        Some(_guard) => next.run(request).await,
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONNECTION, "close")],
            "Server is shutting down",
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let gate = DrainGate::new();
        {
            let _guard = gate.enter().unwrap();
            assert_eq!(gate.in_flight(), 1);
        }
        assert_eq!(gate.in_flight(), 0);
        assert_eq!(gate.admitted(), 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "no request in flight")]
    fn stray_release_panics_in_debug() {
        let gate = DrainGate::new();
        gate.release();
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn stray_release_never_goes_negative() {
        let gate = DrainGate::new();
        gate.release();
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_enter_leaves_admitted_request_in_flight() {
        let gate = DrainGate::new();
        let held = gate.enter().unwrap();
        gate.signal_shutdown();

        assert!(gate.enter().is_none());
        assert_eq!(gate.in_flight(), 1);
        assert_eq!(gate.rejected(), 1);
        assert!(!gate.await_drain(Duration::from_secs(1)).await);

        drop(held);
        assert_eq!(gate.in_flight(), 0);
        assert!(gate.await_drain(Duration::ZERO).await);
    }

    #[test]
    fn signal_is_idempotent() {
        let gate = DrainGate::new();
        gate.signal_shutdown();
        gate.signal_shutdown();
        assert!(gate.is_shutdown());
        assert!(gate.enter().is_none());
        assert_eq!(gate.rejected(), 1);
    }
}
