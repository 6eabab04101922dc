//! Job query/update routes (spec.md §6; `coordinator/api/jobs.py`).

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch};
use axum::{Json, Router};
use conduit_core::Job;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    pub workflow_id: Option<String>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/:workflow_id/:job_id", get(get_job).patch(update_job))
        .with_state(state)
}

/// GET /jobs?workflow_id=...
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> Json<Vec<Job>> {
    Json(state.store.list_jobs(params.workflow_id.as_deref()).await)
}

async fn find_job(state: &AppState, workflow_id: &str, job_id: &str) -> Result<Job, ApiError> {
    let workflow = state
        .store
        .get_workflow(workflow_id)
        .await
        .ok_or_else(|| ApiError::not_found("workflow not found"))?;

    workflow
        .job(job_id)
        .cloned()
        .ok_or_else(|| ApiError::not_found("job not found"))
}

/// GET /jobs/:workflow_id/:job_id
pub async fn get_job(
    State(state): State<AppState>,
    Path((workflow_id, job_id)): Path<(String, String)>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(find_job(&state, &workflow_id, &job_id).await?))
}

/// PATCH /jobs/:workflow_id/:job_id — operator-facing override of a job's
/// mutable fields (status, result, error, retry_count). Scheduling is not
/// re-run as a side effect; this is a raw state edit, not a lifecycle
/// transition (those go through `/workflows/:id/start|cancel` and the
/// worker wire protocol).
pub async fn update_job(
    State(state): State<AppState>,
    Path((workflow_id, job_id)): Path<(String, String)>,
    Json(update): Json<JobPatch>,
) -> Result<Json<Job>, ApiError> {
    find_job(&state, &workflow_id, &job_id).await?;

    state
        .store
        .update_job(&job_id, update.into_store_update())
        .await?;

    Ok(Json(find_job(&state, &workflow_id, &job_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct JobPatch {
    pub status: Option<conduit_core::JobStatus>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: Option<u32>,
}

impl JobPatch {
    fn into_store_update(self) -> conduit_engine::JobUpdate {
        let mut update = conduit_engine::JobUpdate::default();
        if let Some(status) = self.status {
            update.status = Some(status);
        }
        if self.result.is_some() {
            update.result = Some(self.result);
        }
        if self.error.is_some() {
            update.error = Some(self.error);
        }
        if let Some(retry_count) = self.retry_count {
            update.retry_count = Some(retry_count);
        }
        update
    }
}
