use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tracing_subscriber::EnvFilter;
use underwrap_server::{Application, BuildHooks, ServerConfig, UnderwrapServer, default_config};

/// Demo application: `/` greets, `/slow` takes a few seconds
struct DemoApplication;

impl Application for DemoApplication {
    fn register_resources(&self, router: Router) -> Router {
        router
            .route("/", get(|| async { "underwrap is running\n" }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(4)).await;
                    StatusCode::NO_CONTENT
                }),
            )
    }
}

fn load_config() -> Result<ServerConfig, Box<dyn std::error::Error>> {
    match std::env::var_os("UNDERWRAP_CONFIG") {
        Some(path) => Ok(ServerConfig::load(path)?),
        None => Ok(default_config()),
    }
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    // Another subscriber may already be installed.
    let _ = if config.logging.structured {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    init_tracing(&config);

    let server = UnderwrapServer::new(config, DemoApplication);
    server.start(BuildHooks::new()).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    let stopped = server.stop().await;
    if let Ok(metrics) = server.metrics() {
        tracing::info!(?metrics, "Final worker pool metrics");
    }
    stopped.map_err(Into::into)
}
