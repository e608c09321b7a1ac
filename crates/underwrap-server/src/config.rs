//! Server configuration management

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access_log::{DEFAULT_LOG_DIR, DEFAULT_LOG_FORMAT, resolve_log_dir};
use crate::container::normalize_base_path;
use crate::error::ConfigError;
use crate::listener::{ListenerConfig, SocketOptions};

/// Prefix of environment variables overriding file configuration
pub const ENV_PREFIX: &str = "UNDERWRAP";

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Root that relative paths are resolved against; current directory when unset
    pub server_root: Option<PathBuf>,
    /// Listeners used when the listener hook adds none
    pub listeners: Vec<ListenerConfig>,
    /// Request worker pool
    pub worker: WorkerConfig,
    /// Access logging
    pub access_log: AccessLogConfig,
    /// Dispatch container defaults
    pub container: ContainerConfig,
    /// Shutdown timing
    pub shutdown: ShutdownConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker count, used for both core and maximum size
    pub threads: usize,
    /// Idle time before workers above the core size retire
    #[serde(rename = "keep_alive_ms", with = "duration_ms")]
    pub keep_alive: Duration,
}

/// Access log configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessLogConfig {
    /// Enable access logging
    pub enabled: bool,
    /// Line format
    pub format: String,
    /// Log directory; relative paths are resolved against the server root
    pub directory: PathBuf,
}

/// Defaults for the dispatch container descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Deployment name
    pub name: String,
    /// Path the application routes are mounted under, `""` for the root
    pub base_path: String,
}

/// Shutdown timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long in-flight requests get to finish
    #[serde(rename = "drain_timeout_ms", with = "duration_ms")]
    pub drain_timeout: Duration,
    /// How long the worker pool gets to terminate before jobs are cancelled
    #[serde(rename = "termination_timeout_ms", with = "duration_ms")]
    pub termination_timeout: Duration,
    /// Delay between container teardown attempts
    #[serde(rename = "teardown_retry_delay_ms", with = "duration_ms")]
    pub teardown_retry_delay: Duration,
    /// Container teardown attempts, including the first
    pub teardown_max_attempts: u32,
    /// How long listeners get to close their connections before being aborted
    ///
    /// Capped by whatever is left of [`stop_bound`](Self::stop_bound).
    #[serde(rename = "listener_timeout_ms", with = "duration_ms")]
    pub listener_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    pub level: String,
    /// Emit JSON lines
    pub structured: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_root: None,
            listeners: vec![ListenerConfig::default()],
            worker: WorkerConfig::default(),
            access_log: AccessLogConfig::default(),
            container: ContainerConfig::default(),
            shutdown: ShutdownConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, usize::from);
        Self {
            threads: cpus.max(2) * 8,
            keep_alive: Duration::from_secs(60),
        }
    }
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            format: DEFAULT_LOG_FORMAT.to_string(),
            directory: PathBuf::from(DEFAULT_LOG_DIR),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: "underwrap".to_string(),
            base_path: String::new(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            termination_timeout: Duration::from_secs(30),
            teardown_retry_delay: Duration::from_secs(2),
            teardown_max_attempts: 15,
            listener_timeout: Duration::from_secs(10),
        }
    }
}

impl ShutdownConfig {
    /// Upper bound on a whole shutdown sequence
    ///
    /// Drain, pool termination and every teardown delay; listeners only get
    /// the part of it the earlier phases left unused.
    pub fn stop_bound(&self) -> Duration {
        self.drain_timeout
            .saturating_add(self.termination_timeout)
            .saturating_add(
                self.teardown_retry_delay
                    .saturating_mul(self.teardown_max_attempts),
            )
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            structured: false,
        }
    }
}

impl ServerConfig {
    /// Load from `path` (any format the `config` crate understands), then
    /// apply `UNDERWRAP__SECTION__KEY` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that deserialize fine but cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::invalid("listeners", "at least one listener is required"));
        }
        if let Some(listener) = self.listeners.iter().find(|l| l.host.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "listeners.host",
                format!("listener on port {} has an empty host", listener.port),
            ));
        }
        if self.worker.threads == 0 {
            return Err(ConfigError::invalid("worker.threads", "must be at least 1"));
        }
        if self.shutdown.teardown_max_attempts == 0 {
            return Err(ConfigError::invalid(
                "shutdown.teardown_max_attempts",
                "must be at least 1",
            ));
        }
        if let Err(e) = normalize_base_path(&self.container.base_path) {
            return Err(ConfigError::invalid("container.base_path", e.to_string()));
        }
        Ok(())
    }

    /// Server root, falling back to the current directory
    pub fn resolved_server_root(&self) -> PathBuf {
        self.server_root.clone().unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        })
    }

    /// Resolved access-log directory
    pub fn access_log_dir(&self) -> PathBuf {
        resolve_log_dir(&self.resolved_server_root(), Some(&self.access_log.directory))
    }
}

/// Configuration builder
#[derive(Debug)]
pub struct ConfigurationBuilder {
    /// Configuration being built
    config: ServerConfig,
}

impl ConfigurationBuilder {
    /// Create a new configuration builder
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Set the server root
    pub fn server_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.server_root = Some(root.into());
        self
    }

    /// Replace the configured listeners with a single one
    pub fn listener(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.listeners = vec![ListenerConfig::http(host, port)];
        self
    }

    /// Add a listener to the configured ones
    pub fn add_listener(mut self, listener: ListenerConfig) -> Self {
        self.config.listeners.push(listener);
        self
    }

    /// Apply socket options to every configured listener
    #[must_use]
    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        for listener in &mut self.config.listeners {
            listener.socket = options;
        }
        self
    }

    /// Set worker count
    #[must_use]
    pub const fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker.threads = threads;
        self
    }

    /// Enable access logging into `directory`
    pub fn access_log(mut self, directory: impl Into<PathBuf>) -> Self {
        self.config.access_log.enabled = true;
        self.config.access_log.directory = directory.into();
        self
    }

    /// Set the access log line format
    pub fn access_log_format(mut self, format: impl Into<String>) -> Self {
        self.config.access_log.format = format.into();
        self
    }

    /// Set the default deployment name
    pub fn container_name(mut self, name: impl Into<String>) -> Self {
        self.config.container.name = name.into();
        self
    }

    /// Set the default base path
    pub fn base_path(mut self, base_path: impl Into<String>) -> Self {
        self.config.container.base_path = base_path.into();
        self
    }

    /// Set drain timeout
    #[must_use]
    pub const fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown.drain_timeout = timeout;
        self
    }

    /// Set worker pool termination timeout
    #[must_use]
    pub const fn termination_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown.termination_timeout = timeout;
        self
    }

    /// Set container teardown retry delay and attempts
    #[must_use]
    pub const fn teardown_retry(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.config.shutdown.teardown_retry_delay = delay;
        self.config.shutdown.teardown_max_attempts = max_attempts;
        self
    }

    /// Set listener stop timeout
    #[must_use]
    pub const fn listener_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown.listener_timeout = timeout;
        self
    }

    /// Set log level
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Build the configuration
    #[must_use]
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

impl Default for ConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration alias for convenience
pub type Configuration = ServerConfig;

/// Durations as integer milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
