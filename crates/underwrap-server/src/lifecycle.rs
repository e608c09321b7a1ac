//! Server lifecycle state machine
//!
//! States only ever move forward:
//!
//! ```text
//! Created -> Starting -> Running -> Draining -> Stopping -> Stopped
//!    |           |                                             ^
//!    +-----------+---------------------------------------------+
//!      (stop before start, failed start)
//! ```
//!
//! Transitions are computed by [`ServerState::on`], a pure function, and
//! published by [`ServerLifecycle`] which the coordinator writes only from
//! inside its exclusive section.

use std::fmt;

use serde::Serialize;
use tokio::sync::watch;

/// Server states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ServerState {
    /// Constructed, nothing built yet
    Created,
    /// Container, pool and listeners are being brought up
    Starting,
    /// Serving requests
    Running,
    /// Admission closed, waiting for in-flight requests
    Draining,
    /// Releasing the worker pool, container and listeners
    Stopping,
    /// Terminal
    Stopped,
}

/// Events driving [`ServerState`] transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// `start` was called
    Start,
    /// Startup completed
    Started,
    /// Startup failed and partial resources were released
    StartFailed,
    /// `stop` began and admission closed
    Drain,
    /// Drain finished or timed out
    Terminate,
    /// Every shutdown phase ran
    Stopped,
    /// `stop` was called before `start`
    Abandon,
}

/// Rejected transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid lifecycle transition from {from} on {event:?}")]
pub struct InvalidTransition {
    /// State the machine was in
    pub from: ServerState,
    /// Event that does not apply to it
    pub event: LifecycleEvent,
}

impl ServerState {
    /// Compute the state reached from `self` on `event`
    pub const fn on(self, event: LifecycleEvent) -> Result<Self, InvalidTransition> {
        use LifecycleEvent as E;
        match (self, event) {
            (Self::Created, E::Start) => Ok(Self::Starting),
            (Self::Created, E::Abandon) => Ok(Self::Stopped),
            (Self::Starting, E::Started) => Ok(Self::Running),
            (Self::Starting, E::StartFailed) => Ok(Self::Stopped),
            (Self::Running, E::Drain) => Ok(Self::Draining),
            (Self::Draining, E::Terminate) => Ok(Self::Stopping),
            (Self::Stopping, E::Stopped) => Ok(Self::Stopped),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }

    /// `Stopped` accepts no further events
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// `Running` or any later state
    #[must_use]
    pub const fn is_started(self) -> bool {
        matches!(
            self,
            Self::Running | Self::Draining | Self::Stopping | Self::Stopped
        )
    }

    /// Shutdown has begun or finished
    #[must_use]
    pub const fn is_shutting_down(self) -> bool {
        matches!(self, Self::Draining | Self::Stopping | Self::Stopped)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Published server state
///
/// Readers get the current value or a [`watch::Receiver`]; the single writer
/// is the lifecycle coordinator.
#[derive(Debug)]
pub struct ServerLifecycle {
    state: watch::Sender<ServerState>,
}

impl ServerLifecycle {
    /// Create a lifecycle in [`ServerState::Created`]
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(ServerState::Created);
        Self { state }
    }

    /// Get current server state
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Apply `event`; callers must be serialized by the coordinator
    pub(crate) fn apply(&self, event: LifecycleEvent) -> Result<ServerState, InvalidTransition> {
        let from = self.state();
        let to = from.on(event)?;
        self.state.send_replace(to);
        tracing::debug!(%from, %to, ?event, "Server state transition");
        Ok(to)
    }
}

impl Default for ServerLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
