//! Server error types and handling

use std::io;
use std::path::PathBuf;

use crate::container::ContainerState;
use crate::lifecycle::ServerState;
use crate::retry::RetryError;

/// Result type for [`UnderwrapServer::start`](crate::UnderwrapServer::start)
pub type StartResult<T> = Result<T, StartError>;

/// Result type for [`UnderwrapServer::stop`](crate::UnderwrapServer::stop)
pub type StopResult = Result<(), StopError>;

/// Errors that abort server startup
///
/// Every variant is fatal: the server is left `Stopped` and has to be
/// reconstructed before another start.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// Start was called on a server that is not freshly created
    #[error("Cannot start server in state {state}")]
    InvalidState {
        /// State the server was in
        state: ServerState,
    },

    /// The dispatch container failed to deploy or start
    #[error("Deploy failure: {0}")]
    DeployFailure(#[source] ContainerError),

    /// The access-log directory could not be created
    #[error("Failed to create access log directory {}: {source}", path.display())]
    LogSinkInitFailure {
        /// Resolved log directory
        path: PathBuf,
        /// Underlying filesystem error
        #[source]
        source: io::Error,
    },

    /// No configured listener could be bound
    #[error("Bind failure: none of {attempted} listener(s) could bind: {reason}")]
    BindFailure {
        /// Number of listeners that were tried
        attempted: usize,
        /// Last bind error observed
        reason: String,
    },

    /// The worker pool could not be created
    #[error("Worker pool error: {0}")]
    PoolFailure(#[from] PoolError),
}

impl StartError {
    /// Create a bind failure
    pub fn bind_failure(attempted: usize, reason: impl Into<String>) -> Self {
        Self::BindFailure {
            attempted,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the shutdown sequence
///
/// Drain timeouts, forced pool termination and listener errors are logged and
/// never returned; only the dispatch container teardown is escalated because a
/// half-stopped container needs operator attention.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StopError {
    /// Every teardown attempt failed with a retryable error
    #[error("Dispatch container teardown exhausted after {attempts} attempts: {last}")]
    TeardownExhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last: ContainerError,
    },

    /// Teardown failed with an error that is not worth retrying
    #[error("Dispatch container teardown failed on attempt {attempt}: {error}")]
    TeardownFailed {
        /// Attempt that failed
        attempt: u32,
        /// The non-retryable error
        error: ContainerError,
    },
}

impl From<RetryError<ContainerError>> for StopError {
    fn from(err: RetryError<ContainerError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => Self::TeardownExhausted { attempts, last },
            RetryError::Rejected { attempt, error } => Self::TeardownFailed { attempt, error },
        }
    }
}

/// Errors returned by metrics reads
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetricsError {
    /// The server has not finished starting
    #[error("Metrics are unavailable before the server has started (state: {state})")]
    NotStarted {
        /// State at the time of the read
        state: ServerState,
    },

    /// The worker pool does not expose introspection
    #[error("Worker pool {pool} does not support introspection")]
    IntrospectionUnavailable {
        /// Name of the pool
        pool: String,
    },
}

/// Dispatch container errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContainerError {
    /// Another caller is transitioning the container right now
    #[error("Container {name} is busy with another state transition")]
    Busy {
        /// Container name
        name: String,
    },

    /// The configured base path cannot be mounted
    #[error("Invalid base path {path:?}: {reason}")]
    InvalidBasePath {
        /// Offending path
        path: String,
        /// Why it was rejected
        reason: String,
    },

    /// Operation not allowed in the current container state
    #[error("Cannot {operation} container {name} while {state}")]
    IllegalState {
        /// Container name
        name: String,
        /// Attempted operation
        operation: &'static str,
        /// State at the time
        state: ContainerState,
    },

    /// Anything else reported by a container implementation
    #[error("Container error: {0}")]
    Internal(String),
}

impl ContainerError {
    /// Create a busy error
    pub fn busy(name: impl Into<String>) -> Self {
        Self::Busy { name: name.into() }
    }

    /// Create an invalid base path error
    pub fn invalid_base_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidBasePath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an illegal state error
    pub fn illegal_state(
        name: impl Into<String>,
        operation: &'static str,
        state: ContainerState,
    ) -> Self {
        Self::IllegalState {
            name: name.into(),
            operation,
            state,
        }
    }

    /// Check if this error comes from racing transitions and may clear up on retry
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

/// Worker pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The pool no longer accepts tasks
    #[error("Worker pool {name} rejected task: pool is shut down")]
    Rejected {
        /// Pool name
        name: String,
    },

    /// Core/max sizing is inconsistent
    #[error("Invalid worker pool sizing: {0}")]
    InvalidSizing(String),

    /// The pool was created outside a tokio runtime
    #[error("No tokio runtime available to spawn workers for pool {name}")]
    NoRuntime {
        /// Pool name
        name: String,
    },
}

impl PoolError {
    /// Create a rejection error
    pub fn rejected(name: impl Into<String>) -> Self {
        Self::Rejected { name: name.into() }
    }
}

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value failed validation
    #[error("Configuration error: {message}")]
    Invalid {
        /// Error message
        message: String,
        /// Configuration key that caused the error
        key: Option<String>,
    },

    /// The configuration sources could not be read or deserialized
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

impl ConfigError {
    /// Create a validation error for a key
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}
