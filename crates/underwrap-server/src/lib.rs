//! # Underwrap Server
//!
//! Embedded HTTP server with an explicit lifecycle: ordered startup, request
//! draining and bounded graceful shutdown, built on axum and tokio.
//!
//! ## Features
//!
//! - **Lifecycle state machine** - `Created -> Starting -> Running -> Draining -> Stopping -> Stopped`
//! - **Drain gate** - new requests get `503` once shutdown begins; in-flight ones finish
//! - **Worker pool** - handlers run on a sized pool that is shut down gracefully, then forcibly
//! - **Retrying teardown** - the dispatch container is stopped with bounded retries
//! - **Idempotent stop** - any number of concurrent callers, one shutdown sequence
//! - **Pool metrics** - core/max size, active workers and queue depth at any time after start
//! - **Access logging** - pattern-formatted lines to daily-rolling files
//!
//! ## Example
//!
//! ```no_run
//! use axum::Router;
//! use axum::routing::get;
//! use underwrap_server::{BuildHooks, ServerConfig, UnderwrapServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = |router: Router| router.route("/", get(|| async { "hello" }));
//!     let server = UnderwrapServer::new(ServerConfig::default(), app);
//!
//!     server
//!         .start(BuildHooks::new().listeners(|l| l.http_listener(8080, "0.0.0.0")))
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::struct_excessive_bools,
    clippy::missing_panics_doc,
    clippy::default_trait_access
)]

/// Server name
pub const SERVER_NAME: &str = "underwrap-server";
/// Server version
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod access_log;
pub mod config;
pub mod container;
pub mod drain;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod server;

pub use access_log::{AccessLogRecord, AccessLogSink, FileAccessLogSink, LogFormat};
pub use config::{Configuration, ConfigurationBuilder, ServerConfig};
pub use container::{
    Application, ContainerDescriptor, ContainerState, DispatchContainer, RouterContainer,
};
pub use drain::{DrainGate, DrainGuard};
pub use error::{
    ConfigError, ContainerError, MetricsError, PoolError, StartError, StartResult, StopError,
    StopResult,
};
pub use lifecycle::{LifecycleEvent, ServerLifecycle, ServerState};
pub use listener::{ListenerBuilder, ListenerConfig, ListenerInfo, SocketOptions};
pub use metrics::MetricsSnapshot;
pub use pool::{
    PoolIntrospection, PoolShutdown, TaskPool, TaskPoolConfig, WorkerPool, WorkerPoolController,
};
pub use retry::{RetryError, RetryPolicy, RetryingTeardown};
pub use server::{BuildHooks, ServerBuilder, ShutdownHandle, UnderwrapServer};

/// Default server configuration
#[must_use]
pub fn default_config() -> ServerConfig {
    ServerConfig::default()
}

/// Prelude for common server functionality
pub mod prelude {
    pub use crate::{
        Application, BuildHooks, ConfigurationBuilder, ListenerBuilder, MetricsSnapshot,
        ServerConfig, ServerState, ShutdownHandle, StartError, StopError, UnderwrapServer,
        default_config,
    };
}
