use std::time::Duration;

use axum::extract::Query;
use axum::routing::get;
use axum::Router;
use rekindle::config::Config;
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound for `/slow`, so a stray request cannot stall a drain forever
const MAX_SLOW_MS: u64 = 60_000;

#[derive(Debug, Deserialize)]
struct SlowParams {
    ms: Option<u64>,
}

/// Answers with the pid of the process that served the request
async fn whoami() -> String {
    format!("pid {}\n", std::process::id())
}

async fn slow(Query(params): Query<SlowParams>) -> String {
    let ms = params.ms.unwrap_or(1000).min(MAX_SLOW_MS);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    format!("pid {} slept {}ms\n", std::process::id(), ms)
}

fn app() -> Router {
    Router::new()
        .route("/", get(whoami))
        .route("/slow", get(slow))
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rekindle=info".into()),
        )
        .init();

    // Load configuration from CLI args, environment variables, and config file
    let config = Config::load().expect("Failed to load configuration");

    tracing::info!(pid = std::process::id(), "Starting rekindle");
    tracing::info!("  Listening on: {}", config.bind_addr());
    tracing::info!(
        "  Signals: restart={} shutdown={} handoff={}",
        config.signals.restart,
        config.signals.shutdown,
        config.signals.handoff
    );

    if let Err(e) = rekindle::start(&config, app()).await {
        tracing::error!(pid = std::process::id(), "Server failed to start: {}", e);
        std::process::exit(1);
    }

    tracing::info!(pid = std::process::id(), "Server shutdown complete");
}
