//! Server lifecycle coordinator
//!
//! [`UnderwrapServer`] brings the server up in a fixed order and tears it
//! down in the reverse one:
//!
//! ```text
//! start: container -> worker pool -> handler chain -> listeners
//! stop:  close drain gate -> await drain -> pool shutdown
//!        -> container teardown (retried) -> listeners
//! ```
//!
//! A stop never takes longer than
//! [`ShutdownConfig::stop_bound`](crate::config::ShutdownConfig::stop_bound): listeners
//! are aborted once the earlier phases have used up the budget.
//!
//! Both operations run inside one exclusive section, so at most one physical
//! start and one physical shutdown ever happen. Later and concurrent `stop`
//! callers wait for the section and receive the recorded result.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::middleware;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{Mutex, watch};

use crate::access_log::{
    AccessLogSink, FileAccessLogSink, LogFormat, access_log_layer, ensure_log_dir,
};
use crate::config::ServerConfig;
use crate::container::{Application, ContainerDescriptor, DispatchContainer, RouterContainer};
use crate::drain::{DrainGate, drain_layer};
use crate::error::{MetricsError, PoolError, StartError, StartResult, StopError, StopResult};
use crate::lifecycle::{LifecycleEvent, ServerLifecycle, ServerState};
use crate::listener::{ListenerBuilder, ListenerInfo, RunningListener};
use crate::metrics::MetricsSnapshot;
use crate::pool::{TaskPool, TaskPoolConfig, WorkerPool, WorkerPoolController, dispatch_layer};
use crate::retry::RetryingTeardown;

/// Name of the request worker pool
pub const WORKER_POOL_NAME: &str = "underwrap-worker";

type ContainerHook = Box<dyn FnOnce(ContainerDescriptor) -> ContainerDescriptor + Send>;
type HandlerHook = Box<dyn FnOnce(Router) -> Router + Send>;
type ListenerHook = Box<dyn FnOnce(ListenerBuilder) -> ListenerBuilder + Send>;
type ContainerFactory = Arc<dyn Fn(ContainerDescriptor) -> Arc<dyn DispatchContainer> + Send + Sync>;
type PoolFactory =
    Arc<dyn Fn(TaskPoolConfig) -> Result<Arc<dyn WorkerPool>, PoolError> + Send + Sync>;

/// Customization points applied during [`UnderwrapServer::start`]
///
/// Hooks run in order: container descriptor, handler chain, listeners. Values
/// a hook leaves unset are filled from [`ServerConfig`] afterwards.
#[derive(Default)]
pub struct BuildHooks {
    container: Option<ContainerHook>,
    handler: Option<HandlerHook>,
    listeners: Option<ListenerHook>,
}

impl BuildHooks {
    /// No hooks
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjust the container descriptor before deployment
    pub fn container<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(ContainerDescriptor) -> ContainerDescriptor + Send + 'static,
    {
        self.container = Some(Box::new(hook));
        self
    }

    /// Wrap the dispatch router with outer layers
    ///
    /// The result still sits behind the drain gate.
    pub fn handler<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(Router) -> Router + Send + 'static,
    {
        self.handler = Some(Box::new(hook));
        self
    }

    /// Add listeners; when none are added the configured ones are used
    pub fn listeners<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(ListenerBuilder) -> ListenerBuilder + Send + 'static,
    {
        self.listeners = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for BuildHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildHooks")
            .field("container", &self.container.is_some())
            .field("handler", &self.handler.is_some())
            .field("listeners", &self.listeners.is_some())
            .finish()
    }
}

/// Everything a running server owns
struct ServerHandle {
    container: Arc<dyn DispatchContainer>,
    pool: WorkerPoolController,
    gate: Arc<DrainGate>,
    listeners: Vec<RunningListener>,
}

/// Resources created by a start that has not finished yet
#[derive(Default)]
struct PartialStart {
    container: Option<Arc<dyn DispatchContainer>>,
    pool: Option<Arc<dyn WorkerPool>>,
}

impl PartialStart {
    fn release(self) {
        if let Some(pool) = self.pool {
            let dropped = pool.shutdown_now();
            tracing::debug!(pool = pool.name(), dropped, "Released worker pool");
        }
        if let Some(container) = self.container {
            if let Err(e) = container.undeploy() {
                tracing::warn!(container = container.name(), error = %e, "Failed to undeploy container");
            }
        }
    }
}

#[derive(Default)]
struct Section {
    handle: Option<ServerHandle>,
    stop_outcome: Option<StopResult>,
}

/// What readers outside the exclusive section may see
#[derive(Clone)]
struct Published {
    pool: Arc<dyn WorkerPool>,
    listeners: Vec<ListenerInfo>,
}

struct Shared {
    config: ServerConfig,
    application: Arc<dyn Application>,
    access_log_sink: Option<Arc<dyn AccessLogSink>>,
    container_factory: ContainerFactory,
    pool_factory: PoolFactory,
    lifecycle: ServerLifecycle,
    section: Mutex<Section>,
    published: RwLock<Option<Published>>,
}

/// Embedded HTTP server with ordered startup and bounded graceful shutdown
///
/// Cloning is cheap and every clone controls the same server.
#[derive(Clone)]
pub struct UnderwrapServer {
    shared: Arc<Shared>,
}

impl fmt::Debug for UnderwrapServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnderwrapServer")
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl UnderwrapServer {
    /// Create a server for `application`; nothing is built until [`start`](Self::start)
    pub fn new(config: ServerConfig, application: impl Application) -> Self {
        Self::builder(application).config(config).build()
    }

    /// Server builder
    pub fn builder(application: impl Application) -> ServerBuilder {
        ServerBuilder::new(application)
    }

    /// Get server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Get current server state
    pub fn state(&self) -> ServerState {
        self.shared.lifecycle.state()
    }

    /// Subscribe to state changes
    pub fn state_receiver(&self) -> watch::Receiver<ServerState> {
        self.shared.lifecycle.subscribe()
    }

    /// Addresses the server is listening on; empty before start
    pub fn listener_info(&self) -> Vec<ListenerInfo> {
        self.shared
            .published
            .read()
            .as_ref()
            .map(|published| published.listeners.clone())
            .unwrap_or_default()
    }

    /// Get a handle for stopping the server from other tasks
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            server: self.clone(),
        }
    }

    /// Sample the worker pool
    ///
    /// Fails with [`MetricsError::NotStarted`] until the server has started.
    /// After a stop the last pool values stay readable.
    pub fn metrics(&self) -> Result<MetricsSnapshot, MetricsError> {
        let state = self.state();
        if !state.is_started() {
            return Err(MetricsError::NotStarted { state });
        }
        let published = self.shared.published.read().clone();
        match published {
            Some(published) => MetricsSnapshot::capture(published.pool.as_ref()),
            None => Err(MetricsError::NotStarted { state }),
        }
    }

    /// Build and start the server
    ///
    /// Only valid once, from [`ServerState::Created`]. On failure everything
    /// created so far is released and the server ends up `Stopped`.
    pub async fn start(&self, hooks: BuildHooks) -> StartResult<()> {
        let mut section = self.shared.section.lock().await;
        let state = self.state();
        if state != ServerState::Created {
            return Err(StartError::InvalidState { state });
        }
        self.transition(LifecycleEvent::Start);
        tracing::info!("Starting server");

        let mut partial = PartialStart::default();
        match self.build(hooks, &mut partial).await {
            Ok(handle) => {
                *self.shared.published.write() = Some(Published {
                    pool: Arc::clone(handle.pool.pool()),
                    listeners: handle.listeners.iter().map(RunningListener::info).collect(),
                });
                section.handle = Some(handle);
                self.transition(LifecycleEvent::Started);
                tracing::info!(listeners = ?self.listener_info(), "Server started");
                Ok(())
            }
            Err(e) => {
                partial.release();
                self.transition(LifecycleEvent::StartFailed);
                tracing::error!(error = %e, "Server failed to start");
                Err(e)
            }
        }
    }

    async fn build(&self, hooks: BuildHooks, partial: &mut PartialStart) -> StartResult<ServerHandle> {
        let BuildHooks {
            container: container_hook,
            handler: handler_hook,
            listeners: listener_hook,
        } = hooks;
        let config = &self.shared.config;

        let mut descriptor = ContainerDescriptor::new(self.shared.application.router());
        if let Some(hook) = container_hook {
            descriptor = hook(descriptor);
        }
        let container = (self.shared.container_factory)(descriptor.with_defaults(&config.container));
        container.deploy().map_err(StartError::DeployFailure)?;
        partial.container = Some(Arc::clone(&container));
        let routes = container.start().map_err(StartError::DeployFailure)?;

        let pool = (self.shared.pool_factory)(TaskPoolConfig::fixed(
            WORKER_POOL_NAME,
            config.worker.threads,
            config.worker.keep_alive,
        ))?;
        partial.pool = Some(Arc::clone(&pool));

        let gate = Arc::new(DrainGate::new());
        let mut router = routes.layer(middleware::from_fn_with_state(
            Arc::clone(&pool),
            dispatch_layer,
        ));
        if let Some(hook) = handler_hook {
            router = hook(router);
        }
        router = router.layer(middleware::from_fn_with_state(Arc::clone(&gate), drain_layer));
        if config.access_log.enabled {
            let sink = self.access_log_sink()?;
            router = router.layer(middleware::from_fn_with_state(sink, access_log_layer));
        }

        let mut builder = ListenerBuilder::new();
        if let Some(hook) = listener_hook {
            builder = hook(builder);
        }
        let listener_configs = if builder.is_empty() {
            config.listeners.clone()
        } else {
            builder.build()
        };

        let mut listeners = Vec::with_capacity(listener_configs.len());
        let mut last_error = String::from("no listeners configured");
        for listener in &listener_configs {
            let bound = match listener.bind().await {
                Ok(tcp) => RunningListener::serve(tcp, router.clone(), &listener.socket),
                Err(e) => Err(e),
            };
            match bound {
                Ok(running) => listeners.push(running),
                Err(e) => {
                    tracing::warn!(listener = %listener.authority(), error = %e, "Failed to bind listener");
                    last_error = format!("{}: {e}", listener.authority());
                }
            }
        }
        if listeners.is_empty() {
            return Err(StartError::bind_failure(listener_configs.len(), last_error));
        }

        Ok(ServerHandle {
            container,
            pool: WorkerPoolController::new(pool),
            gate,
            listeners,
        })
    }

    fn access_log_sink(&self) -> StartResult<Arc<dyn AccessLogSink>> {
        let config = &self.shared.config;
        let dir = config.access_log_dir();
        ensure_log_dir(&dir).map_err(|source| StartError::LogSinkInitFailure {
            path: dir.clone(),
            source,
        })?;

        if let Some(sink) = &self.shared.access_log_sink {
            return Ok(Arc::clone(sink));
        }
        let sink = FileAccessLogSink::new(&dir, LogFormat::parse(&config.access_log.format))
            .map_err(|source| StartError::LogSinkInitFailure {
                path: dir.clone(),
                source,
            })?;
        tracing::info!(path = %dir.display(), "Access logging enabled");
        Ok(Arc::new(sink))
    }

    /// Stop the server
    ///
    /// Safe to call any number of times from any number of tasks: the first
    /// caller runs the shutdown sequence, the others wait for it and get the
    /// same result. Calling it before [`start`](Self::start) moves the server
    /// straight to `Stopped`.
    pub async fn stop(&self) -> StopResult {
        let mut section = self.shared.section.lock().await;
        if let Some(outcome) = &section.stop_outcome {
            tracing::debug!("Server already stopped");
            return outcome.clone();
        }

        let Some(handle) = section.handle.take() else {
            if self.state() == ServerState::Created {
                self.transition(LifecycleEvent::Abandon);
                tracing::info!("Server stopped before it was started");
            }
            section.stop_outcome = Some(Ok(()));
            return Ok(());
        };

        let outcome = self.shutdown(handle).await;
        section.stop_outcome = Some(outcome.clone());
        outcome
    }

    async fn shutdown(&self, handle: ServerHandle) -> StopResult {
        let ServerHandle {
            container,
            pool,
            gate,
            listeners,
        } = handle;
        let timing = &self.shared.config.shutdown;
        let started = Instant::now();

        self.transition(LifecycleEvent::Drain);
        gate.signal_shutdown();
        if gate.await_drain(timing.drain_timeout).await {
            tracing::info!(admitted = gate.admitted(), "All in-flight requests completed");
        } else {
            tracing::warn!(
                in_flight = gate.in_flight(),
                timeout_ms = timing.drain_timeout.as_millis() as u64,
                "Drain timeout elapsed; continuing shutdown"
            );
        }

        self.transition(LifecycleEvent::Terminate);
        pool.shutdown(timing.termination_timeout).await;

        let policy =
            RetryingTeardown::policy(timing.teardown_retry_delay, timing.teardown_max_attempts);
        let teardown = RetryingTeardown::stop(container.as_ref(), &policy)
            .await
            .map(|_| ())
            .map_err(StopError::from);
        if let Err(e) = &teardown {
            tracing::error!(container = container.name(), error = %e, "Dispatch container teardown failed");
        }

        let listener_timeout = timing
            .listener_timeout
            .min(timing.stop_bound().saturating_sub(started.elapsed()));
        join_all(
            listeners
                .into_iter()
                .map(|listener| listener.stop(listener_timeout)),
        )
        .await;

        self.transition(LifecycleEvent::Stopped);
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            rejected = gate.rejected(),
            "Server stopped"
        );
        teardown
    }

    /// Apply a transition; only called from inside the exclusive section
    fn transition(&self, event: LifecycleEvent) {
        if let Err(e) = self.shared.lifecycle.apply(event) {
            tracing::error!(error = %e, "Lifecycle transition rejected");
        }
    }
}

fn router_container(descriptor: ContainerDescriptor) -> Arc<dyn DispatchContainer> {
    Arc::new(RouterContainer::new(descriptor))
}

fn task_pool(config: TaskPoolConfig) -> Result<Arc<dyn WorkerPool>, PoolError> {
    let pool: Arc<dyn WorkerPool> = Arc::new(TaskPool::new(config)?);
    Ok(pool)
}

/// Builder for [`UnderwrapServer`]
pub struct ServerBuilder {
    config: ServerConfig,
    application: Arc<dyn Application>,
    access_log_sink: Option<Arc<dyn AccessLogSink>>,
    container_factory: ContainerFactory,
    pool_factory: PoolFactory,
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("access_log_sink", &self.access_log_sink.is_some())
            .finish_non_exhaustive()
    }
}

impl ServerBuilder {
    /// Builder with default configuration
    pub fn new(application: impl Application) -> Self {
        Self {
            config: ServerConfig::default(),
            application: Arc::new(application),
            access_log_sink: None,
            container_factory: Arc::new(router_container),
            pool_factory: Arc::new(task_pool),
        }
    }

    /// Set configuration
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Send access-log records to `sink` instead of the rolling log files
    ///
    /// Only used when access logging is enabled in the configuration.
    pub fn access_log_sink(mut self, sink: impl AccessLogSink + 'static) -> Self {
        self.access_log_sink = Some(Arc::new(sink));
        self
    }

    /// Deploy the application into containers made by `factory`
    ///
    /// The factory receives the descriptor after the container hook ran and
    /// the configured defaults were applied. Defaults to [`RouterContainer`].
    pub fn container_factory<F, C>(mut self, factory: F) -> Self
    where
        F: Fn(ContainerDescriptor) -> C + Send + Sync + 'static,
        C: DispatchContainer + 'static,
    {
        self.container_factory = Arc::new(move |descriptor| {
            let container: Arc<dyn DispatchContainer> = Arc::new(factory(descriptor));
            container
        });
        self
    }

    /// Run requests on pools made by `factory`
    ///
    /// The factory receives the sizing from the `worker` configuration.
    /// Defaults to [`TaskPool`].
    pub fn pool_factory<F, P>(mut self, factory: F) -> Self
    where
        F: Fn(TaskPoolConfig) -> Result<P, PoolError> + Send + Sync + 'static,
        P: WorkerPool + 'static,
    {
        self.pool_factory = Arc::new(move |config| {
            let pool: Arc<dyn WorkerPool> = Arc::new(factory(config)?);
            Ok(pool)
        });
        self
    }

    /// Build the server
    pub fn build(self) -> UnderwrapServer {
        UnderwrapServer {
            shared: Arc::new(Shared {
                config: self.config,
                application: self.application,
                access_log_sink: self.access_log_sink,
                container_factory: self.container_factory,
                pool_factory: self.pool_factory,
                lifecycle: ServerLifecycle::new(),
                section: Mutex::new(Section::default()),
                published: RwLock::new(None),
            }),
        }
    }
}

/// Handle for stopping the server from signal handlers or other tasks
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    server: UnderwrapServer,
}

impl ShutdownHandle {
    /// Stop the server; see [`UnderwrapServer::stop`]
    pub async fn shutdown(&self) -> StopResult {
        self.server.stop().await
    }

    /// Check if shutdown has begun or finished
    pub fn is_shutting_down(&self) -> bool {
        self.server.state().is_shutting_down()
    }
}
