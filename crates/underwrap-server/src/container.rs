//! Dispatch container hosting the application's routes
//!
//! A container is deployed (routes registered and mounted under the base
//! path), started (begins accepting dispatches) and later stopped and
//! undeployed by the shutdown sequence. Transitions on one container are
//! serialized; a caller that races another transition gets
//! [`ContainerError::Busy`] and is expected to retry.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::ContainerConfig;
use crate::error::ContainerError;

/// Container states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ContainerState {
    /// Not deployed, or undeployed after a stop
    Undeployed,
    /// Routes registered, not dispatching
    Deployed,
    /// Dispatching requests
    Started,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undeployed => "undeployed",
            Self::Deployed => "deployed",
            Self::Started => "started",
        };
        f.write_str(name)
    }
}

/// Lifecycle of the component that dispatches requests to the application
pub trait DispatchContainer: Send + Sync + fmt::Debug {
    /// Deployment name
    fn name(&self) -> &str;

    /// Current state
    fn state(&self) -> ContainerState;

    /// Register routes; `Undeployed -> Deployed`
    fn deploy(&self) -> Result<(), ContainerError>;

    /// Begin dispatching and hand out the request router; `Deployed -> Started`
    fn start(&self) -> Result<Router, ContainerError>;

    /// Stop dispatching; `Started -> Deployed`, a no-op in any other state
    fn stop(&self) -> Result<(), ContainerError>;

    /// Unregister routes; `Deployed -> Undeployed`, stopping first if needed
    fn undeploy(&self) -> Result<(), ContainerError>;
}

/// Application mounted into the dispatch container
///
/// Both methods are called once, at deploy time.
pub trait Application: Send + Sync + 'static {
    /// Add routes and their state to `router`
    fn register_resources(&self, router: Router) -> Router;

    /// Wrap the registered routes with application-level layers
    fn register_layers(&self, router: Router) -> Router {
        router
    }

    /// Build the application's router
    fn router(&self) -> Router {
        self.register_layers(self.register_resources(Router::new()))
    }
}

impl<F> Application for F
where
    F: Fn(Router) -> Router + Send + Sync + 'static,
{
    fn register_resources(&self, router: Router) -> Router {
        self(router)
    }
}

/// Deployment description handed to the container build hook
#[derive(Debug)]
pub struct ContainerDescriptor {
    name: Option<String>,
    base_path: Option<String>,
    router: Router,
}

impl ContainerDescriptor {
    /// Describe a deployment of `router` with no name or base path yet
    pub fn new(router: Router) -> Self {
        Self {
            name: None,
            base_path: None,
            router,
        }
    }

    /// Set the deployment name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the base path the routes are mounted under
    pub fn base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    /// Replace the router
    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    /// Transform the router
    pub fn map_router(mut self, f: impl FnOnce(Router) -> Router) -> Self {
        self.router = f(self.router);
        self
    }

    /// Deployment name, if set
    pub fn deployment_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Base path, if set
    pub fn deployment_base_path(&self) -> Option<&str> {
        self.base_path.as_deref()
    }

    /// Fill unset fields from `defaults`; fields set by a hook win
    pub fn with_defaults(mut self, defaults: &ContainerConfig) -> Self {
        if self.name.is_none() {
            self.name = Some(defaults.name.clone());
        }
        if self.base_path.is_none() {
            self.base_path = Some(defaults.base_path.clone());
        }
        self
    }
}

/// Normalize a base path to `""` (root) or `/segment[/segment...]`
pub fn normalize_base_path(path: &str) -> Result<String, ContainerError> {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(String::new());
    }
    if !trimmed.starts_with('/') {
        return Err(ContainerError::invalid_base_path(path, "must start with '/'"));
    }
    if trimmed.contains(['*', '{', '}', ':']) {
        return Err(ContainerError::invalid_base_path(
            path,
            "must not contain wildcards or captures",
        ));
    }
    if trimmed.contains("//") {
        return Err(ContainerError::invalid_base_path(path, "contains an empty segment"));
    }
    Ok(trimmed.to_owned())
}

/// [`DispatchContainer`] backed by an axum [`Router`]
pub struct RouterContainer {
    name: String,
    base_path: String,
    inner: Mutex<Inner>,
    accepting: Arc<AtomicBool>,
}

struct Inner {
    state: ContainerState,
    routes: Option<Router>,
    pending: Option<Router>,
}

impl RouterContainer {
    /// Create an undeployed container from a descriptor
    pub fn new(descriptor: ContainerDescriptor) -> Self {
        let ContainerDescriptor {
            name,
            base_path,
            router,
        } = descriptor;
        Self {
            name: name.unwrap_or_default(),
            base_path: base_path.unwrap_or_default(),
            inner: Mutex::new(Inner {
                state: ContainerState::Undeployed,
                routes: None,
                pending: Some(router),
            }),
            accepting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Base path as configured
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    fn lock(&self) -> Result<parking_lot::MutexGuard<'_, Inner>, ContainerError> {
        self.inner
            .try_lock()
            .ok_or_else(|| ContainerError::busy(&self.name))
    }
}

impl fmt::Debug for RouterContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterContainer")
            .field("name", &self.name)
            .field("base_path", &self.base_path)
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DispatchContainer for RouterContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ContainerState {
        self.inner.lock().state
    }

    fn deploy(&self) -> Result<(), ContainerError> {
        let mut inner = self.lock()?;
        if inner.state != ContainerState::Undeployed {
            return Err(ContainerError::illegal_state(&self.name, "deploy", inner.state));
        }
        let router = inner.pending.take().ok_or_else(|| {
            ContainerError::Internal(format!("container {} cannot be redeployed", self.name))
        })?;

        let base_path = match normalize_base_path(&self.base_path) {
            Ok(base_path) => base_path,
            Err(e) => {
                inner.pending = Some(router);
                return Err(e);
            }
        };
        let mounted = if base_path.is_empty() {
            router
        } else {
            Router::new().nest(&base_path, router)
        };
        let routes = mounted.layer(middleware::from_fn_with_state(
            Arc::clone(&self.accepting),
            dispatch_guard,
        ));

        inner.routes = Some(routes);
        inner.state = ContainerState::Deployed;
        tracing::info!(container = %self.name, base_path = %base_path, "Container deployed");
        Ok(())
    }

    fn start(&self) -> Result<Router, ContainerError> {
        let mut inner = self.lock()?;
        if inner.state != ContainerState::Deployed {
            return Err(ContainerError::illegal_state(&self.name, "start", inner.state));
        }
        let routes = inner.routes.clone().ok_or_else(|| {
            ContainerError::Internal(format!("container {} has no routes", self.name))
        })?;

        self.accepting.store(true, Ordering::Release);
        inner.state = ContainerState::Started;
        tracing::info!(container = %self.name, "Container started");
        Ok(routes)
    }

    fn stop(&self) -> Result<(), ContainerError> {
        let mut inner = self.lock()?;
        if inner.state == ContainerState::Started {
            self.accepting.store(false, Ordering::Release);
            inner.state = ContainerState::Deployed;
            tracing::info!(container = %self.name, "Container stopped");
        }
        Ok(())
    }

    fn undeploy(&self) -> Result<(), ContainerError> {
        let mut inner = self.lock()?;
        if inner.state == ContainerState::Started {
            self.accepting.store(false, Ordering::Release);
        }
        if inner.state != ContainerState::Undeployed {
            inner.routes = None;
            inner.state = ContainerState::Undeployed;
            tracing::info!(container = %self.name, "Container undeployed");
        }
        Ok(())
    }
}

async fn dispatch_guard(
    State(accepting): State<Arc<AtomicBool>>,
    request: Request,
    next: Next,
) -> Response {
    if accepting.load(Ordering::Acquire) {
        next.run(request).await
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Container is not started").into_response()
    }
}
