//! Scheduler (§4.C): capability-matched dispatch of a single job to an idle
//! worker, with full reversal of state on transmission failure.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{CoordinatorMessage, JobType, Worker, WorkerStatus};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::store::StateStore;

/// Narrow interface the workflow engine consumes to place a job on a worker
/// (spec.md §9: breaking the engine/registry circular dependency). Returns
/// the assigned worker id, or `None` if no suitable worker could take the
/// job — never an error; dispatch failure is a normal outcome the caller
/// leaves the job pending/retrying for (spec.md §4.C step 2, §7).
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, job_id: &str, job_type: JobType, parameters: Value) -> Option<String>;
}

/// Default [`Dispatcher`]: deterministic round-robin over idle,
/// capability-matched workers by worker-id sort order (spec.md §4.C step 3 —
/// a seam; richer policies can be substituted without changing the trait).
pub struct Scheduler {
    store: Arc<dyn StateStore>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn select_worker(job_type: JobType, workers: &[Worker]) -> Option<&Worker> {
        let mut candidates: Vec<&Worker> = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Idle && w.can_run(job_type))
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        candidates.into_iter().next()
    }
}

#[async_trait]
impl Dispatcher for Scheduler {
    #[instrument(skip(self, parameters))]
    async fn dispatch(&self, job_id: &str, job_type: JobType, parameters: Value) -> Option<String> {
        let workers = self.store.list_workers().await;
        let worker = Self::select_worker(job_type, &workers)?;
        let worker_id = worker.id.clone();

        if self.store.assign_job(job_id, &worker_id).await.is_err() {
            warn!(%job_id, %worker_id, "failed to record assignment, aborting dispatch");
            return None;
        }

        let Some(connection) = self.store.get_connection(&worker_id).await else {
            warn!(%job_id, %worker_id, "no live connection for selected worker, reversing assignment");
            let _ = self.store.unassign_job(job_id).await;
            return None;
        };

        let message = CoordinatorMessage::JobAssignment {
            job_id: job_id.to_string(),
            job_type,
            parameters,
            timestamp: chrono::Utc::now(),
        };

        match connection.send(message).await {
            Ok(()) => {
                info!(%job_id, %worker_id, "job assigned");
                Some(worker_id)
            }
            Err(err) => {
                warn!(%job_id, %worker_id, %err, "failed to write job_assignment, reversing assignment");
                let _ = self.store.unassign_job(job_id).await;
                None
            }
        }
    }
}
