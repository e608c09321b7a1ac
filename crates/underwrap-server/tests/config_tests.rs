//! Tests for configuration defaults, loading and validation

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use pretty_assertions::assert_eq;
use underwrap_server::config::{ConfigurationBuilder, ServerConfig};
use underwrap_server::{ConfigError, ListenerConfig};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_toml_overrides_defaults() {
    let file = write_config(
        r#"
server_root = "/srv/underwrap"

[[listeners]]
host = "0.0.0.0"
port = 9000

[[listeners]]
host = "::1"
port = 9001
socket = { tcp_nodelay = false, backlog = 64 }

[worker]
threads = 12

[access_log]
enabled = true
directory = "access"

[container]
name = "shop"
base_path = "/shop"

[shutdown]
drain_timeout_ms = 5000
teardown_max_attempts = 3
"#,
    );

    let config = ServerConfig::load(file.path()).unwrap();

    assert_eq!(config.server_root, Some(PathBuf::from("/srv/underwrap")));
    assert_eq!(config.listeners[0], ListenerConfig::http("0.0.0.0", 9000));
    assert_eq!(config.listeners[1].port, 9001);
    assert!(!config.listeners[1].socket.tcp_nodelay);
    assert!(config.listeners[1].socket.reuse_address);
    assert_eq!(config.listeners[1].socket.backlog, 64);
    assert_eq!(config.worker.threads, 12);
    assert_eq!(config.container.name, "shop");
    assert_eq!(config.shutdown.drain_timeout, Duration::from_secs(5));
    assert_eq!(config.shutdown.teardown_max_attempts, 3);
    // Untouched values keep their defaults.
    assert_eq!(config.shutdown.termination_timeout, Duration::from_secs(30));
    assert_eq!(config.shutdown.teardown_retry_delay, Duration::from_secs(2));
    assert_eq!(config.access_log_dir(), PathBuf::from("/srv/underwrap/access"));
}

#[test]
fn test_load_rejects_invalid_values() {
    let file = write_config(
        r#"
[shutdown]
teardown_max_attempts = 0
"#,
    );

    match ServerConfig::load(file.path()) {
        Err(ConfigError::Invalid { key, .. }) => {
            assert_eq!(key.as_deref(), Some("shutdown.teardown_max_attempts"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn test_load_missing_file_fails() {
    let result = ServerConfig::load("/definitely/not/here.toml");
    assert!(matches!(result, Err(ConfigError::Load(_))));
}

#[test]
fn test_builder_sets_every_section() {
    let config = ConfigurationBuilder::new()
        .server_root("/srv")
        .listener("0.0.0.0", 80)
        .worker_threads(3)
        .access_log("/var/log/underwrap")
        .container_name("api")
        .base_path("/api")
        .drain_timeout(Duration::from_secs(1))
        .teardown_retry(Duration::from_millis(10), 4)
        .log_level("debug")
        .build();

    assert!(config.validate().is_ok());
    assert_eq!(config.listeners, vec![ListenerConfig::http("0.0.0.0", 80)]);
    assert!(config.access_log.enabled);
    assert_eq!(config.access_log_dir(), PathBuf::from("/var/log/underwrap"));
    assert_eq!(config.container.base_path, "/api");
    assert_eq!(config.shutdown.teardown_max_attempts, 4);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_config_serializes_durations_as_millis() {
    let json = serde_json::to_value(ServerConfig::default()).unwrap();
    assert_eq!(json["shutdown"]["drain_timeout_ms"], 30_000);
    assert_eq!(json["shutdown"]["teardown_max_attempts"], 15);
    assert_eq!(json["access_log"]["directory"], "log");
}
