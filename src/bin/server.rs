//! capability-engine HTTP server binary.
//!
//! Builds an engine from configuration, registers the built-in
//! capabilities and serves the routes in [`capability_engine::server`].
//!
//! # Environment Variables
//!
//! - `PORT` — HTTP port (default: 8080)
//! - `CAPENGINE_CONFIG` — Path to a YAML `EngineConfig` (optional)
//! - `CAPENGINE_*` — Per-field overrides, see `EngineConfig::apply_env`
//! - `RUST_LOG` — Tracing filter (default: "info,capability_engine=debug")
//!
//! # Usage
//!
//! ```bash
//! CAPENGINE_CONFIG=engine.yaml cargo run --bin capability-server
//! ```

use std::sync::Arc;

use anyhow::Context;
use capability_engine::capabilities::EchoCapability;
use capability_engine::config::EngineConfig;
use capability_engine::context::EngineContext;
use capability_engine::coordinator::ExecutionCoordinator;
use capability_engine::server::{app_router, AppState};

fn load_config() -> anyhow::Result<EngineConfig> {
    let config = match std::env::var("CAPENGINE_CONFIG") {
        Ok(path) => EngineConfig::from_file(&path)
            .with_context(|| format!("loading config from {}", path))?,
        Err(_) => EngineConfig::default(),
    };
    config
        .apply_env()
        .context("applying CAPENGINE_* overrides")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,capability_engine=debug".into()),
        )
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let bind_addr = format!("0.0.0.0:{}", port);

    let engine = Arc::new(EngineContext::new(load_config()?).context("invalid configuration")?);
    engine
        .registry
        .register(EchoCapability::spec(), Arc::new(EchoCapability))
        .context("registering built-in capabilities")?;
    engine.resilience.alerts.start();

    let coordinator = Arc::new(ExecutionCoordinator::new(engine));
    let app = app_router(AppState::new(coordinator));

    tracing::info!("capability-engine {} starting on {}", capability_engine::VERSION, bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health        — liveness probe");
    tracing::info!("  GET  /capabilities  — registered capabilities");
    tracing::info!("  POST /execute       — run an execution request");
    tracing::info!("  GET  /approvals     — pending approvals");
    tracing::info!("  GET  /stats         — engine statistics");
    tracing::info!("  GET  /alerts        — recent threshold alerts");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;

    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}
