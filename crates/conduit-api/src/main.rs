// Conduit coordinator — control-plane API server

mod config;
mod error;
mod health;
mod jobs;
mod state;
mod workers;
mod workflows;
mod yaml;

use anyhow::{Context, Result};
use axum::Router;
use conduit_engine::{Coordinator, EngineConfig};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::ApiConfig;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_api=debug,conduit_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("conduit coordinator starting...");

    let api_config = ApiConfig::from_env();
    let coordinator = build_coordinator(&api_config.engine).await?;

    let heartbeat_token = coordinator.spawn_heartbeat_monitor();

    let state = AppState {
        store: coordinator.store.clone(),
        engine: coordinator.engine.clone(),
        registry: coordinator.registry.clone(),
    };

    let app = Router::new()
        .merge(health::routes(state.clone()))
        .merge(workflows::routes(state.clone()))
        .merge(jobs::routes(state.clone()))
        .merge(workers::routes(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&api_config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", api_config.bind_addr))?;
    tracing::info!(addr = %api_config.bind_addr, "listening");

    let result = axum::serve(listener, app).await.context("server error");
    heartbeat_token.cancel();
    result
}

async fn build_coordinator(config: &EngineConfig) -> Result<Coordinator> {
    Coordinator::build(config)
        .await
        .context("failed to build coordinator")
}
