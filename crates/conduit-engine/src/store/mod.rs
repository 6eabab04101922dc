//! State store: the single source of truth over workflows, jobs, workers,
//! assignments and live connections.
//!
//! This module provides:
//! - [`StateStore`] trait for the authoritative entity maps
//! - [`InMemoryStateStore`] backing implementation
//! - [`PostgresPersistence`] optional write-through durable tier

mod cache;
mod memory;
mod postgres;

pub use cache::{CacheTier, RedisCache};
pub use memory::InMemoryStateStore;
pub use postgres::{PersistenceError, PostgresPersistence, Snapshot};

use async_trait::async_trait;
use conduit_core::{Job, JobStatus, Workflow, Worker};
use std::sync::Arc;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow already exists: {0}")]
    WorkflowAlreadyExists(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("durable write failed: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Structural update of a job's mutable fields. `None` means "leave
/// unchanged"; fields that are themselves optional use a nested `Option` so
/// that "clear this field" can be expressed (e.g. `worker_id: Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub worker_id: Option<Option<String>>,
    pub result: Option<Option<serde_json::Value>>,
    pub error: Option<Option<String>>,
    pub retry_count: Option<u32>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, worker_id: Option<String>) -> Self {
        self.worker_id = Some(worker_id);
        self
    }

    pub fn with_result(mut self, result: Option<serde_json::Value>) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }
}

/// Error sending a message down a worker's connection.
#[derive(Debug, thiserror::Error)]
#[error("failed to send message to worker: {0}")]
pub struct SendError(pub String);

/// Narrow abstraction over a live worker socket. The store holds these as
/// trait objects so it never depends on the transport (axum WebSocket, in
/// this repo's case).
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    async fn send(&self, message: conduit_core::CoordinatorMessage) -> Result<(), SendError>;
}

/// The single authority for workflows, jobs, workers, assignments and live
/// connections (§4.A). Every mutation is serialised with respect to other
/// mutations of the same entity type; implementations backed by coarse
/// locking satisfy this trivially.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    // Workflows
    async fn get_workflow(&self, workflow_id: &str) -> Option<Workflow>;
    async fn add_workflow(&self, workflow: Workflow) -> Result<(), StoreError>;
    async fn remove_workflow(&self, workflow_id: &str) -> Result<(), StoreError>;
    async fn list_workflows(&self) -> Vec<Workflow>;
    async fn update_workflow_status(
        &self,
        workflow_id: &str,
        status: conduit_core::WorkflowStatus,
    ) -> Result<(), StoreError>;

    // Jobs (jobs are addressed by their own id; they belong to exactly one
    // workflow for their entire lifetime, see conduit-core::job)
    async fn get_job(&self, job_id: &str) -> Option<Job>;
    async fn add_job(&self, workflow_id: &str, job: Job) -> Result<(), StoreError>;
    async fn remove_job(&self, job_id: &str) -> Result<(), StoreError>;
    async fn list_jobs(&self, workflow_id: Option<&str>) -> Vec<Job>;
    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<(), StoreError>;
    /// The workflow a job belongs to, for handlers that only receive a job id
    /// off the wire (job lifetime = workflow lifetime, per conduit-core::job).
    async fn workflow_id_for_job(&self, job_id: &str) -> Option<String>;

    // Workers
    async fn get_worker(&self, worker_id: &str) -> Option<Worker>;
    async fn add_worker(&self, worker: Worker) -> Result<(), StoreError>;
    async fn remove_worker(&self, worker_id: &str) -> Result<(), StoreError>;
    async fn list_workers(&self) -> Vec<Worker>;

    // Assignments
    async fn assign_job(&self, job_id: &str, worker_id: &str) -> Result<(), StoreError>;
    async fn unassign_job(&self, job_id: &str) -> Result<(), StoreError>;
    async fn get_job_worker(&self, job_id: &str) -> Option<String>;
    async fn get_worker_jobs(&self, worker_id: &str) -> Vec<String>;

    // Connections (transient; never persisted)
    async fn record_connection(&self, worker_id: &str, sink: Arc<dyn ConnectionSink>);
    async fn drop_connection(&self, worker_id: &str);
    async fn get_connection(&self, worker_id: &str) -> Option<Arc<dyn ConnectionSink>>;
}
