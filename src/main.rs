//! Pulse Orchestrator — Binary Entrypoint
//! Boots the scheduler engine and the Axum HTTP server around it.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use feedpulse::api::{create_router, AppState};
use feedpulse::engine::{collaborators_from_env, rules_path_from_env, PulseEngine};
use feedpulse::metrics::Metrics;

fn init_tracing() {
    let filter = std::env::var("LOG_FILTER").unwrap_or_else(|_| "feedpulse=info,warn".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let rules_path = rules_path_from_env();
    let engine = PulseEngine::new(rules_path, collaborators_from_env()).await?;

    // Initial load must succeed; a rules file that never parses is the one
    // startup condition worth aborting on.
    engine.start().await.context("starting pulse engine")?;

    let sources = engine
        .rules_snapshot()
        .map(|r| r.sources.len())
        .unwrap_or(0);
    let metrics = Metrics::init(sources);

    let state = AppState {
        engine: engine.clone(),
    };
    let router = create_router(state).merge(metrics.router());

    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()
        .context("parsing BIND_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "pulse listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    // New triggers stop; an in-flight run finishes before we return.
    engine.stop().await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
