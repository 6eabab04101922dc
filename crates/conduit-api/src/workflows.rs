//! Workflow CRUD + lifecycle routes (spec.md §6; `coordinator/api/workflows.py`).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use conduit_core::Workflow;

use crate::error::ApiError;
use crate::state::AppState;
use crate::yaml;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflows", get(list_workflows).post(create_workflow))
        .route("/workflows/from-yaml", post(create_workflow_from_yaml))
        .route(
            "/workflows/:workflow_id",
            get(get_workflow).delete(delete_workflow),
        )
        .route("/workflows/:workflow_id/start", post(start_workflow))
        .route("/workflows/:workflow_id/cancel", post(cancel_workflow))
        .with_state(state)
}

/// GET /workflows
pub async fn list_workflows(State(state): State<AppState>) -> Json<Vec<Workflow>> {
    Json(state.store.list_workflows().await)
}

/// POST /workflows — accepts a fully-formed `Workflow` document (the JSON
/// twin of the YAML format below). Graph soundness is validated before the
/// workflow is stored.
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(workflow): Json<Workflow>,
) -> Result<(StatusCode, Json<Workflow>), ApiError> {
    if state.store.get_workflow(&workflow.id).await.is_some() {
        return Err(ApiError::bad_request("workflow already exists"));
    }

    conduit_engine::engine::validate_definition(&workflow.jobs)
        .map_err(|e| ApiError::bad_request(format!("invalid workflow definition: {e}")))?;

    state.store.add_workflow(workflow.clone()).await?;
    tracing::info!(workflow_id = %workflow.id, "workflow created");
    Ok((StatusCode::CREATED, Json(workflow)))
}

/// POST /workflows/from-yaml
pub async fn create_workflow_from_yaml(
    State(state): State<AppState>,
    body: String,
) -> Result<(StatusCode, Json<Workflow>), ApiError> {
    let workflow = yaml::parse_yaml_workflow(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid workflow definition: {e}")))?;

    if state.store.get_workflow(&workflow.id).await.is_some() {
        return Err(ApiError::bad_request("workflow already exists"));
    }

    conduit_engine::engine::validate_definition(&workflow.jobs)
        .map_err(|e| ApiError::bad_request(format!("invalid workflow definition: {e}")))?;

    state.store.add_workflow(workflow.clone()).await?;
    tracing::info!(workflow_id = %workflow.id, "workflow created from yaml");
    Ok((StatusCode::CREATED, Json(workflow)))
}

/// GET /workflows/:workflow_id
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<Workflow>, ApiError> {
    state
        .store
        .get_workflow(&workflow_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("workflow not found"))
}

/// DELETE /workflows/:workflow_id
pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.store.get_workflow(&workflow_id).await.is_none() {
        return Err(ApiError::not_found("workflow not found"));
    }
    state.store.remove_workflow(&workflow_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /workflows/:workflow_id/start
pub async fn start_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.start_workflow(&workflow_id).await?;
    Ok(StatusCode::OK)
}

/// POST /workflows/:workflow_id/cancel
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.cancel_workflow(&workflow_id).await?;
    Ok(StatusCode::OK)
}
