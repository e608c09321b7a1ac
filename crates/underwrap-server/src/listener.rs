//! HTTP listeners
//!
//! Listeners are described by [`ListenerConfig`], collected by the listener
//! build hook through a [`ListenerBuilder`], bound with explicit socket
//! options and served by axum with graceful shutdown.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Socket options applied before `listen`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// `SO_REUSEADDR`
    pub reuse_address: bool,
    /// `TCP_NODELAY` on accepted connections
    pub tcp_nodelay: bool,
    /// Listen backlog
    pub backlog: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reuse_address: true,
            tcp_nodelay: true,
            backlog: 1024,
        }
    }
}

/// One HTTP listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host name or IP address
    pub host: String,
    /// Port, `0` for an ephemeral one
    pub port: u16,
    /// Socket options
    pub socket: SocketOptions,
}

impl ListenerConfig {
    /// HTTP listener on `host:port` with default socket options
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            socket: SocketOptions::default(),
        }
    }

    /// `host:port` as written in configuration
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Resolve and bind the listener socket
    pub async fn bind(&self) -> io::Result<TcpListener> {
        let mut last_err = None;
        for addr in tokio::net::lookup_host(self.authority()).await? {
            match bind_socket(addr, &self.socket) {
                Ok(listener) => return Ok(listener),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{} resolved to no addresses", self.authority()),
            )
        }))
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::http("127.0.0.1", 8080)
    }
}

fn bind_socket(addr: SocketAddr, options: &SocketOptions) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(options.reuse_address)?;
    socket.bind(addr)?;
    socket.listen(options.backlog)
}

/// Listeners collected by the listener build hook
#[derive(Debug, Clone, Default)]
pub struct ListenerBuilder {
    listeners: Vec<ListenerConfig>,
    socket: Option<SocketOptions>,
}

impl ListenerBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an HTTP listener on `host:port`
    pub fn http_listener(mut self, port: u16, host: impl Into<String>) -> Self {
        self.listeners.push(ListenerConfig::http(host, port));
        self
    }

    /// Add a fully described listener
    pub fn listener(mut self, listener: ListenerConfig) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Override socket options for every listener added through this builder
    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.socket = Some(options);
        self
    }

    /// Whether no listener was added
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Listeners with the socket override applied
    pub fn build(self) -> Vec<ListenerConfig> {
        let Self { listeners, socket } = self;
        match socket {
            Some(options) => listeners
                .into_iter()
                .map(|listener| ListenerConfig {
                    socket: options,
                    ..listener
                })
                .collect(),
            None => listeners,
        }
    }
}

/// A bound listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListenerInfo {
    /// Local address, with the real port when `0` was configured
    pub address: SocketAddr,
}

/// Listener being served on its own task
#[derive(Debug)]
pub(crate) struct RunningListener {
    info: ListenerInfo,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<io::Result<()>>,
}

impl RunningListener {
    /// Start serving `router` on `listener`
    pub(crate) fn serve(
        listener: TcpListener,
        router: Router,
        options: &SocketOptions,
    ) -> io::Result<Self> {
        let address = listener.local_addr()?;
        let (shutdown, signal) = oneshot::channel::<()>();

        let serve = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .tcp_nodelay(options.tcp_nodelay)
        .with_graceful_shutdown(async move {
            let _ = signal.await;
        });
        let task = tokio::spawn(async move { serve.await });

        tracing::info!(listener = %address, "Listener started");
        Ok(Self {
            info: ListenerInfo { address },
            shutdown: Some(shutdown),
            task,
        })
    }

    pub(crate) fn info(&self) -> ListenerInfo {
        self.info
    }

    /// Close the listener, letting open connections finish within `timeout`
    pub(crate) async fn stop(mut self, timeout: Duration) {
        let address = self.info.address;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(Ok(()))) => tracing::info!(listener = %address, "Listener stopped"),
            Ok(Ok(Err(e))) => {
                tracing::warn!(listener = %address, error = %e, "Listener exited with error");
            }
            Ok(Err(e)) => {
                tracing::warn!(listener = %address, error = %e, "Listener task failed");
            }
            Err(_) => {
                tracing::warn!(
                    listener = %address,
                    timeout_ms = timeout.as_millis() as u64,
                    "Listener did not stop in time; aborting accept loop"
                );
                self.task.abort();
            }
        }
    }
}
