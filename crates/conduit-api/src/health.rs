//! Health/readiness routes (spec.md §6; `coordinator/api/health.py`).

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use conduit_core::WorkerStatus;
use serde::Serialize;

use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Serialize)]
struct RootResponse {
    service: &'static str,
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        service: "conduit-coordinator",
        status: "running",
        timestamp: chrono::Utc::now(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    workflows: usize,
    workers: usize,
    active_workers: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let workflows = state.store.list_workflows().await;
    let workers = state.store.list_workers().await;
    let active_workers = workers.iter().filter(|w| w.status != WorkerStatus::Offline).count();

    Json(HealthResponse {
        status: "healthy",
        workflows: workflows.len(),
        workers: workers.len(),
        active_workers,
    })
}
