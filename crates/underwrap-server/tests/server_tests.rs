//! End-to-end tests for the lifecycle coordinator


use std::time::{Duration, Instant};

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use pretty_assertions::assert_eq;
use test_helpers::{
    CollectingSink, FlakyContainer, OpaquePool, SLOW_REQUEST, base_url, http_client, start_server,
    test_app, test_config,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use underwrap_server::prelude::*;
use underwrap_server::{ContainerError, ContainerState, ListenerConfig, MetricsError};

#[tokio::test]
async fn test_serves_requests_on_ephemeral_port() {
    let (server, url) = start_server(test_config()).await;
    assert_eq!(server.state(), ServerState::Running);
    assert_ne!(server.listener_info()[0].address.port(), 0);

    let body = http_client().get(&url).send().await.unwrap().text().await.unwrap();
    assert_eq!(body, "ok");

    server.stop().await.unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_request_completes_during_stop() {
    let (server, url) = start_server(test_config()).await;
    let client = http_client();

    let slow = tokio::spawn({
        let client = client.clone();
        let url = format!("{url}/slow");
        async move { client.get(url).send().await.map(|r| r.status()) }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    let stop_started = Instant::now();
    let stopping = tokio::spawn({
        let server = server.clone();
        async move { server.stop().await }
    });

    // New requests are refused while the slow one drains.
    let mut states = server.state_receiver();
    states
        .wait_for(|state| *state >= ServerState::Draining)
        .await
        .unwrap();
    let refused = http_client().get(&url).send().await;
    if let Ok(response) = refused {
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    assert_eq!(slow.await.unwrap().unwrap(), StatusCode::NO_CONTENT);
    stopping.await.unwrap().unwrap();

    let stop_took = stop_started.elapsed();
    assert!(stop_took >= SLOW_REQUEST - Duration::from_secs(2), "stop took {stop_took:?}");
    assert!(stop_took < Duration::from_secs(10), "stop took {stop_took:?}");
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stop_runs_once() {
    let (server, _url) = start_server(test_config()).await;

    let mut callers = Vec::new();
    for _ in 0..10 {
        let handle = server.shutdown_handle();
        callers.push(tokio::spawn(async move { handle.shutdown().await }));
    }
    for caller in callers {
        assert!(caller.await.unwrap().is_ok());
    }

    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.stop().await.is_ok());
    assert!(server.shutdown_handle().is_shutting_down());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stop_tears_container_down_once() {
    let container = FlakyContainer::started(0);
    let server = UnderwrapServer::builder(test_app)
        .config(test_config())
        .container_factory({
            let container = container.clone();
            move |_| container.clone()
        })
        .build();
    server.start(BuildHooks::new()).await.unwrap();

    let mut callers = Vec::new();
    for _ in 0..10 {
        let server = server.clone();
        callers.push(tokio::spawn(async move { server.stop().await }));
    }
    for caller in callers {
        assert!(caller.await.unwrap().is_ok());
    }

    assert_eq!(container.stop_calls(), 1);
    assert_eq!(*container.state.lock(), ContainerState::Undeployed);
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn test_teardown_exhaustion_still_stops_listeners() {
    let container = FlakyContainer::started(u32::MAX);
    let server = UnderwrapServer::builder(test_app)
        .config(test_config())
        .container_factory({
            let container = container.clone();
            move |_| container.clone()
        })
        .build();
    server.start(BuildHooks::new()).await.unwrap();
    let address = server.listener_info()[0].address;

    let err = server.stop().await.unwrap_err();
    assert!(
        matches!(
            err,
            StopError::TeardownExhausted {
                attempts: 3,
                last: ContainerError::Busy { .. }
            }
        ),
        "unexpected error: {err:?}"
    );
    assert_eq!(container.stop_calls(), 3);
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(TcpStream::connect(address).await.is_err());

    // Later callers get the recorded failure without another teardown.
    assert!(matches!(
        server.stop().await,
        Err(StopError::TeardownExhausted { attempts: 3, .. })
    ));
    assert_eq!(container.stop_calls(), 3);
}

#[tokio::test]
async fn test_metrics_without_pool_introspection() {
    let server = UnderwrapServer::builder(test_app)
        .config(test_config())
        .pool_factory(|_| Ok(OpaquePool))
        .build();
    server.start(BuildHooks::new()).await.unwrap();

    assert_eq!(
        server.metrics(),
        Err(MetricsError::IntrospectionUnavailable {
            pool: "opaque".into()
        })
    );

    server.stop().await.unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn test_stalled_connection_does_not_extend_stop() {
    let config = ConfigurationBuilder::new()
        .listener("127.0.0.1", 0)
        .worker_threads(2)
        .drain_timeout(Duration::from_millis(200))
        .termination_timeout(Duration::from_millis(200))
        .teardown_retry(Duration::from_millis(50), 3)
        .listener_timeout(Duration::from_secs(3))
        .build();
    let bound = config.shutdown.stop_bound();
    assert_eq!(bound, Duration::from_millis(550));
    let (server, _url) = start_server(config).await;

    // Half a request head, then silence.
    let mut stalled = TcpStream::connect(server.listener_info()[0].address)
        .await
        .unwrap();
    stalled
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    server.stop().await.unwrap();
    let took = started.elapsed();

    assert!(took < bound + Duration::from_millis(250), "stop took {took:?}");
    assert_eq!(server.state(), ServerState::Stopped);
    drop(stalled);
}

#[tokio::test]
async fn test_drain_timeout_still_stops() {
    let config = ConfigurationBuilder::new()
        .listener("127.0.0.1", 0)
        .worker_threads(2)
        .drain_timeout(Duration::from_millis(200))
        .termination_timeout(Duration::from_millis(200))
        .listener_timeout(Duration::from_millis(200))
        .build();
    let (server, url) = start_server(config).await;

    let slow = tokio::spawn(async move { http_client().get(format!("{url}/slow")).send().await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    server.stop().await.unwrap();
    assert!(started.elapsed() < SLOW_REQUEST);
    assert_eq!(server.state(), ServerState::Stopped);

    // The cancelled request never gets its 204.
    if let Ok(Ok(response)) = slow.await {
        assert_ne!(response.status(), StatusCode::NO_CONTENT);
    }
}

#[tokio::test]
async fn test_metrics_before_and_after_start() {
    let server = UnderwrapServer::new(test_config(), test_app);
    assert_eq!(
        server.metrics(),
        Err(MetricsError::NotStarted {
            state: ServerState::Created
        })
    );

    server.start(BuildHooks::new()).await.unwrap();
    let snapshot = server.metrics().unwrap();
    assert_eq!(snapshot.core_pool_size, 4);
    assert_eq!(snapshot.max_pool_size, 4);
    assert!(snapshot.active_count <= 4);

    server.stop().await.unwrap();
    assert!(server.metrics().is_ok());
}

#[tokio::test]
async fn test_start_after_stop_fails() {
    let (server, _url) = start_server(test_config()).await;
    server.stop().await.unwrap();

    let err = server.start(BuildHooks::new()).await.unwrap_err();
    assert!(matches!(
        err,
        StartError::InvalidState {
            state: ServerState::Stopped
        }
    ));
}

#[tokio::test]
async fn test_stop_before_start() {
    let server = UnderwrapServer::new(test_config(), test_app);
    server.stop().await.unwrap();

    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.start(BuildHooks::new()).await.is_err());
}

#[tokio::test]
async fn test_bind_failure_leaves_server_stopped() {
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let mut config = test_config();
    config.listeners = vec![ListenerConfig {
        socket: underwrap_server::SocketOptions {
            reuse_address: false,
            ..Default::default()
        },
        ..ListenerConfig::http("127.0.0.1", port)
    }];
    let server = UnderwrapServer::new(config, test_app);

    let err = server.start(BuildHooks::new()).await.unwrap_err();
    assert!(matches!(err, StartError::BindFailure { attempted: 1, .. }));
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.listener_info().is_empty());
}

#[tokio::test]
async fn test_invalid_base_path_is_deploy_failure() {
    let server = UnderwrapServer::new(test_config(), test_app);
    let hooks = BuildHooks::new().container(|descriptor| descriptor.base_path("no-leading-slash"));

    let err = server.start(hooks).await.unwrap_err();
    assert!(matches!(err, StartError::DeployFailure(_)));
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test]
async fn test_hooks_shape_the_server() {
    let server = UnderwrapServer::new(test_config(), test_app);
    let hooks = BuildHooks::new()
        .container(|descriptor| descriptor.base_path("/app"))
        .handler(|router: Router| router.route("/health", get(|| async { "healthy" })))
        .listeners(|listeners| listeners.http_listener(0, "127.0.0.1"));
    server.start(hooks).await.unwrap();
    let url = base_url(&server);
    let client = http_client();

    let app = client.get(format!("{url}/app")).send().await.unwrap();
    assert_eq!(app.text().await.unwrap(), "ok");
    let health = client.get(format!("{url}/health")).send().await.unwrap();
    assert_eq!(health.text().await.unwrap(), "healthy");
    let unmounted = client.get(&url).send().await.unwrap();
    assert_eq!(unmounted.status(), StatusCode::NOT_FOUND);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_access_log_records_requests() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigurationBuilder::new()
        .listener("127.0.0.1", 0)
        .worker_threads(2)
        .server_root(dir.path())
        .access_log("logs/access")
        .build();
    let sink = CollectingSink::default();
    let server = UnderwrapServer::builder(test_app)
        .config(config)
        .access_log_sink(sink.clone())
        .build();
    server.start(BuildHooks::new()).await.unwrap();

    let url = base_url(&server);
    http_client()
        .get(&url)
        .header("X-Forwarded-For", "203.0.113.7")
        .send()
        .await
        .unwrap();
    server.stop().await.unwrap();

    assert!(dir.path().join("logs/access").is_dir());
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, 200);
    assert_eq!(records[0].request_line(), "GET / HTTP/1.1");
    assert_eq!(
        records[0].headers.get("x-forwarded-for").unwrap(),
        "203.0.113.7"
    );
    assert!(records[0].remote_addr.is_some());
}
