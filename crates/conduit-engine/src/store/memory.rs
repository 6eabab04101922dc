//! In-memory implementation of [`StateStore`]
//!
//! Durable storage, when configured, sits strictly behind this store: reads
//! always go memory-first (the hot path is allocation-free) and writes go
//! through before the in-memory mutation is applied.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{Job, JobStatus, Worker, WorkerStatus, Workflow, WorkflowStatus};
use parking_lot::RwLock;
use tracing::{instrument, warn};

use super::cache::CacheTier;
use super::postgres::PostgresPersistence;
use super::{ConnectionSink, JobUpdate, StateStore, StoreError};

/// In-memory implementation of [`StateStore`], optionally backed by a
/// write-through durable tier and a best-effort read cache.
pub struct InMemoryStateStore {
    workflows: RwLock<HashMap<String, Workflow>>,
    job_index: RwLock<HashMap<String, String>>,
    workers: RwLock<HashMap<String, Worker>>,
    assignments: RwLock<HashMap<String, String>>,
    connections: RwLock<HashMap<String, Arc<dyn ConnectionSink>>>,
    persistence: Option<Arc<PostgresPersistence>>,
    cache: Option<Arc<dyn CacheTier>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            job_index: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            persistence: None,
            cache: None,
        }
    }

    pub fn with_persistence(persistence: Arc<PostgresPersistence>) -> Self {
        Self {
            persistence: Some(persistence),
            ..Self::new()
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheTier>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Load every workflow, its jobs, all workers and all assignments from
    /// durable storage into memory. Must run before the store accepts
    /// traffic (§4.A). A no-op when persistence isn't configured.
    #[instrument(skip(self))]
    pub async fn rebuild(&self) -> Result<(), StoreError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };

        let snapshot = persistence.load_all().await?;

        let mut job_index = self.job_index.write();
        let mut workflows = self.workflows.write();
        for workflow in snapshot.workflows {
            for job in &workflow.jobs {
                job_index.insert(job.id.clone(), workflow.id.clone());
            }
            workflows.insert(workflow.id.clone(), workflow);
        }
        drop(workflows);
        drop(job_index);

        let mut workers = self.workers.write();
        for worker in snapshot.workers {
            workers.insert(worker.id.clone(), worker);
        }
        drop(workers);

        let mut assignments = self.assignments.write();
        for (job_id, worker_id) in snapshot.assignments {
            assignments.insert(job_id, worker_id);
        }

        Ok(())
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_workflow(&self, workflow_id: &str) -> Option<Workflow> {
        if let Some(workflow) = self.workflows.read().get(workflow_id).cloned() {
            return Some(workflow);
        }
        if let Some(cache) = &self.cache {
            return cache.get_workflow(workflow_id).await;
        }
        None
    }

    async fn add_workflow(&self, workflow: Workflow) -> Result<(), StoreError> {
        if self.workflows.read().contains_key(&workflow.id) {
            return Err(StoreError::WorkflowAlreadyExists(workflow.id));
        }

        if let Some(persistence) = &self.persistence {
            persistence.save_workflow(&workflow).await?;
        }

        let mut job_index = self.job_index.write();
        for job in &workflow.jobs {
            job_index.insert(job.id.clone(), workflow.id.clone());
        }
        drop(job_index);

        if let Some(cache) = &self.cache {
            cache.put_workflow(&workflow).await;
        }
        self.workflows.write().insert(workflow.id.clone(), workflow);
        Ok(())
    }

    async fn remove_workflow(&self, workflow_id: &str) -> Result<(), StoreError> {
        if let Some(persistence) = &self.persistence {
            persistence.delete_workflow(workflow_id).await?;
        }

        let removed = self.workflows.write().remove(workflow_id);
        if let Some(workflow) = removed {
            let mut job_index = self.job_index.write();
            for job in &workflow.jobs {
                job_index.remove(&job.id);
            }
        }
        if let Some(cache) = &self.cache {
            cache.invalidate_workflow(workflow_id).await;
        }
        Ok(())
    }

    async fn list_workflows(&self) -> Vec<Workflow> {
        self.workflows.read().values().cloned().collect()
    }

    async fn update_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
    ) -> Result<(), StoreError> {
        if let Some(persistence) = &self.persistence {
            persistence.update_workflow_status(workflow_id, status).await?;
        }

        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        workflow.status = status;
        workflow.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Option<Job> {
        if let Some(workflow_id) = self.job_index.read().get(job_id).cloned() {
            if let Some(job) = self
                .workflows
                .read()
                .get(&workflow_id)
                .and_then(|w| w.job(job_id))
                .cloned()
            {
                return Some(job);
            }
        }
        if let Some(cache) = &self.cache {
            return cache.get_job(job_id).await;
        }
        None
    }

    async fn add_job(&self, workflow_id: &str, job: Job) -> Result<(), StoreError> {
        if let Some(persistence) = &self.persistence {
            persistence.save_job(workflow_id, &job).await?;
        }

        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;
        self.job_index
            .write()
            .insert(job.id.clone(), workflow_id.to_string());
        workflow.jobs.push(job);
        Ok(())
    }

    async fn remove_job(&self, job_id: &str) -> Result<(), StoreError> {
        if let Some(persistence) = &self.persistence {
            persistence.delete_job(job_id).await?;
        }

        let workflow_id = self
            .job_index
            .write()
            .remove(job_id)
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;

        let mut workflows = self.workflows.write();
        if let Some(workflow) = workflows.get_mut(&workflow_id) {
            workflow.jobs.retain(|j| j.id != job_id);
            workflow.current_jobs.remove(job_id);
            workflow.completed_jobs.remove(job_id);
            workflow.failed_jobs.remove(job_id);
        }
        drop(workflows);
        if let Some(cache) = &self.cache {
            cache.invalidate_job(job_id).await;
        }
        Ok(())
    }

    async fn workflow_id_for_job(&self, job_id: &str) -> Option<String> {
        self.job_index.read().get(job_id).cloned()
    }

    async fn list_jobs(&self, workflow_id: Option<&str>) -> Vec<Job> {
        let workflows = self.workflows.read();
        match workflow_id {
            Some(id) => workflows.get(id).map(|w| w.jobs.clone()).unwrap_or_default(),
            None => workflows.values().flat_map(|w| w.jobs.clone()).collect(),
        }
    }

    #[instrument(skip(self, update))]
    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<(), StoreError> {
        let workflow_id = self
            .job_index
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;

        if let Some(persistence) = &self.persistence {
            persistence
                .update_job(&workflow_id, job_id, &update)
                .await?;
        }

        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.clone()))?;

        let previous_status = workflow.job(job_id).map(|j| j.status);

        {
            let job = workflow
                .job_mut(job_id)
                .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;

            if let Some(status) = update.status {
                job.status = status;
            }
            if let Some(worker_id) = update.worker_id {
                job.worker_id = worker_id;
            }
            if let Some(result) = update.result {
                job.result = result;
            }
            if let Some(error) = update.error {
                job.error = error;
            }
            if let Some(retry_count) = update.retry_count {
                job.retry_count = retry_count;
            }
            job.updated_at = chrono::Utc::now();
        }

        if let Some(new_status) = update.status {
            if previous_status != Some(new_status) {
                workflow.current_jobs.remove(job_id);
                workflow.completed_jobs.remove(job_id);
                workflow.failed_jobs.remove(job_id);

                match new_status {
                    JobStatus::Running | JobStatus::Retrying => {
                        workflow.current_jobs.insert(job_id.to_string());
                    }
                    JobStatus::Completed => {
                        workflow.completed_jobs.insert(job_id.to_string());
                    }
                    JobStatus::Failed => {
                        workflow.failed_jobs.insert(job_id.to_string());
                    }
                    JobStatus::Pending | JobStatus::Skipped => {}
                }
            }
        }

        workflow.updated_at = chrono::Utc::now();
        drop(workflows);

        if let Some(cache) = &self.cache {
            cache.invalidate_job(job_id).await;
            cache.invalidate_workflow(&workflow_id).await;
        }
        Ok(())
    }

    async fn get_worker(&self, worker_id: &str) -> Option<Worker> {
        self.workers.read().get(worker_id).cloned()
    }

    async fn add_worker(&self, worker: Worker) -> Result<(), StoreError> {
        if let Some(persistence) = &self.persistence {
            persistence.save_worker(&worker).await?;
        }
        self.workers.write().insert(worker.id.clone(), worker);
        Ok(())
    }

    async fn remove_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        if let Some(persistence) = &self.persistence {
            persistence.delete_worker(worker_id).await?;
        }
        self.workers.write().remove(worker_id);
        Ok(())
    }

    async fn list_workers(&self) -> Vec<Worker> {
        self.workers.read().values().cloned().collect()
    }

    async fn assign_job(&self, job_id: &str, worker_id: &str) -> Result<(), StoreError> {
        if let Some(persistence) = &self.persistence {
            persistence.save_assignment(job_id, worker_id).await?;
        }

        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.to_string()))?;
        worker.status = WorkerStatus::Busy;
        worker.current_job_id = Some(job_id.to_string());
        drop(workers);

        self.assignments
            .write()
            .insert(job_id.to_string(), worker_id.to_string());
        Ok(())
    }

    async fn unassign_job(&self, job_id: &str) -> Result<(), StoreError> {
        if let Some(persistence) = &self.persistence {
            persistence.delete_assignment(job_id).await?;
        }

        let worker_id = self.assignments.write().remove(job_id);
        if let Some(worker_id) = worker_id {
            let mut workers = self.workers.write();
            if let Some(worker) = workers.get_mut(&worker_id) {
                worker.status = WorkerStatus::Idle;
                worker.current_job_id = None;
            } else {
                warn!(%worker_id, "unassigning job for a worker no longer in the store");
            }
        }
        Ok(())
    }

    async fn get_job_worker(&self, job_id: &str) -> Option<String> {
        self.assignments.read().get(job_id).cloned()
    }

    async fn get_worker_jobs(&self, worker_id: &str) -> Vec<String> {
        self.assignments
            .read()
            .iter()
            .filter(|(_, w)| w.as_str() == worker_id)
            .map(|(j, _)| j.clone())
            .collect()
    }

    async fn record_connection(&self, worker_id: &str, sink: Arc<dyn ConnectionSink>) {
        self.connections.write().insert(worker_id.to_string(), sink);
    }

    async fn drop_connection(&self, worker_id: &str) {
        self.connections.write().remove(worker_id);
    }

    async fn get_connection(&self, worker_id: &str) -> Option<Arc<dyn ConnectionSink>> {
        self.connections.read().get(worker_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::JobType;
    use std::collections::HashSet;

    fn sample_workflow() -> Workflow {
        let mut a = Job::new("a", JobType::Validation);
        a.on_success = vec!["b".to_string()];
        let b = Job::new("b", JobType::Processing);
        Workflow::new("wf-1", "demo", vec![a, b])
    }

    #[tokio::test]
    async fn add_and_get_workflow_round_trips() {
        let store = InMemoryStateStore::new();
        store.add_workflow(sample_workflow()).await.unwrap();

        let loaded = store.get_workflow("wf-1").await.unwrap();
        assert_eq!(loaded.jobs.len(), 2);
    }

    #[tokio::test]
    async fn adding_duplicate_workflow_id_fails() {
        let store = InMemoryStateStore::new();
        store.add_workflow(sample_workflow()).await.unwrap();
        let err = store.add_workflow(sample_workflow()).await.unwrap_err();
        assert!(matches!(err, StoreError::WorkflowAlreadyExists(_)));
    }

    #[tokio::test]
    async fn get_job_finds_job_across_workflow_by_global_id() {
        let store = InMemoryStateStore::new();
        store.add_workflow(sample_workflow()).await.unwrap();

        let job = store.get_job("b").await.unwrap();
        assert_eq!(job.id, "b");
    }

    #[tokio::test]
    async fn update_job_status_keeps_workflow_sets_disjoint() {
        let store = InMemoryStateStore::new();
        store.add_workflow(sample_workflow()).await.unwrap();

        store
            .update_job("a", JobUpdate::status(JobStatus::Running))
            .await
            .unwrap();
        let wf = store.get_workflow("wf-1").await.unwrap();
        assert!(wf.current_jobs.contains("a"));

        store
            .update_job("a", JobUpdate::status(JobStatus::Completed))
            .await
            .unwrap();
        let wf = store.get_workflow("wf-1").await.unwrap();
        assert!(!wf.current_jobs.contains("a"));
        assert!(wf.completed_jobs.contains("a"));
        assert!(wf.current_jobs.is_disjoint(&wf.completed_jobs));
    }

    #[tokio::test]
    async fn assign_and_unassign_job_maintains_worker_state() {
        let store = InMemoryStateStore::new();
        store.add_workflow(sample_workflow()).await.unwrap();
        store
            .add_worker(Worker::new(
                "worker-1",
                HashSet::from([JobType::Validation]),
            ))
            .await
            .unwrap();

        store.assign_job("a", "worker-1").await.unwrap();
        let worker = store.get_worker("worker-1").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Busy);
        assert_eq!(worker.current_job_id.as_deref(), Some("a"));
        assert_eq!(store.get_job_worker("a").await.as_deref(), Some("worker-1"));

        store.unassign_job("a").await.unwrap();
        let worker = store.get_worker("worker-1").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert!(worker.current_job_id.is_none());
        assert!(store.get_job_worker("a").await.is_none());
    }
}
