//! Worker registry (§4.B): connection lifecycle, heartbeat liveness, and
//! failed-worker job reassignment.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{CoordinatorMessage, JobStatus, JobType, Worker, WorkerMessage, WorkerStatus};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::store::{ConnectionSink, StateStore};

/// A worker's connection went silent, completed a job or failed a job.
/// Narrow interface the registry consumes so it never reaches into the
/// workflow engine's internals (spec.md §9).
#[async_trait]
pub trait JobEventSink: Send + Sync {
    async fn on_job_completion(&self, job_id: &str, result: Option<Value>);
    async fn on_job_failure(&self, job_id: &str, reason: FailureReason);
    /// A worker signalled `ready`: reattempt scheduling of pending/retrying
    /// jobs across every running workflow (spec.md §4.B).
    async fn reschedule_pending(&self);
}

/// The structured cause of a job failure, carried through to
/// [`conduit_core::Job::error`] as a formatted string.
#[derive(Debug, Clone)]
pub enum FailureReason {
    /// Reported directly by the worker executing the job.
    Reported(String),
    /// The worker holding this job stopped heartbeating or its socket closed.
    WorkerDisconnected { worker_id: String },
    /// Rebuild from durable storage found this job still marked in-flight.
    CoordinatorRestart,
    /// The workflow was cancelled while this job was running.
    WorkflowCancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reported(msg) => write!(f, "{msg}"),
            Self::WorkerDisconnected { worker_id } => {
                write!(f, "worker_disconnected: worker_id={worker_id}")
            }
            Self::CoordinatorRestart => write!(f, "coordinator restart"),
            Self::WorkflowCancelled => write!(f, "workflow cancelled"),
        }
    }
}

/// How long between sweeps of the worker table for stale heartbeats.
pub const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// How long a worker may go without a heartbeat before being ejected.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Owns worker connection lifecycle and converts socket events into engine
/// calls. One cooperative reader task per connection is expected to call
/// [`WorkerRegistry::handle_message`] for each frame it decodes; this struct
/// itself holds no per-connection task state beyond what the state store
/// already tracks (§4.B, §5: "a single background task" for the monitor,
/// one per-connection reader for the rest).
pub struct WorkerRegistry {
    store: Arc<dyn StateStore>,
    sink: Arc<dyn JobEventSink>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn StateStore>, sink: Arc<dyn JobEventSink>) -> Self {
        Self { store, sink }
    }

    /// Accept a newly connected worker socket. The caller is responsible for
    /// the transport accept; this records the connection so the scheduler
    /// can address it.
    pub async fn connect(&self, worker_id: &str, sink: Arc<dyn ConnectionSink>) {
        self.store.record_connection(worker_id, sink).await;
        info!(%worker_id, "worker connected");
    }

    /// Tear down a worker's connection and treat every job still assigned
    /// to it as failed (spec.md §4.B "Failed-worker handling").
    pub async fn disconnect(&self, worker_id: &str) {
        self.store.drop_connection(worker_id).await;
        self.eject_worker(worker_id).await;
    }

    async fn eject_worker(&self, worker_id: &str) {
        let in_flight = self.store.get_worker_jobs(worker_id).await;
        let _ = self.store.remove_worker(worker_id).await;

        if in_flight.is_empty() {
            return;
        }

        warn!(%worker_id, count = in_flight.len(), "worker failed with in-flight jobs, triggering reassignment");

        for job_id in in_flight {
            let _ = self.store.unassign_job(&job_id).await;
            self.sink
                .on_job_failure(
                    &job_id,
                    FailureReason::WorkerDisconnected {
                        worker_id: worker_id.to_string(),
                    },
                )
                .await;
        }
    }

    /// Dispatch one decoded inbound frame. Unknown message types never reach
    /// here (they fail to deserialize into [`WorkerMessage`] and are logged
    /// by the caller, spec.md §6).
    #[instrument(skip(self, message))]
    pub async fn handle_message(&self, worker_id: &str, message: WorkerMessage) -> Option<CoordinatorMessage> {
        match message {
            WorkerMessage::Register { capabilities } => {
                self.handle_register(worker_id, capabilities).await;
                Some(CoordinatorMessage::registration_ack(worker_id))
            }
            WorkerMessage::Heartbeat { .. } => {
                self.handle_heartbeat(worker_id).await;
                Some(CoordinatorMessage::heartbeat_ack())
            }
            WorkerMessage::JobStatus {
                job_id,
                status,
                result,
                ..
            } => {
                self.handle_job_status(&job_id, &status, result).await;
                None
            }
            WorkerMessage::Ready { .. } => {
                self.handle_ready(worker_id).await;
                None
            }
        }
    }

    async fn handle_register(&self, worker_id: &str, capabilities: Vec<JobType>) {
        let worker = Worker::new(worker_id, capabilities.into_iter().collect::<HashSet<_>>());
        if self.store.add_worker(worker).await.is_err() {
            warn!(%worker_id, "failed to register worker");
        } else {
            info!(%worker_id, "worker registered");
        }
    }

    async fn handle_heartbeat(&self, worker_id: &str) {
        // The store has no direct "touch heartbeat" op; re-add with a fresh
        // timestamp, matching the registry's authority over worker liveness.
        if let Some(mut worker) = self.store.get_worker(worker_id).await {
            worker.last_heartbeat = chrono::Utc::now();
            let _ = self.store.add_worker(worker).await;
        }
    }

    async fn handle_job_status(&self, job_id: &str, status: &str, result: Option<Value>) {
        match status {
            "completed" => self.sink.on_job_completion(job_id, result).await,
            "failed" => {
                let reason = result
                    .as_ref()
                    .and_then(|v| v.get("error").and_then(|e| e.as_str()))
                    .unwrap_or("job reported failure")
                    .to_string();
                self.sink.on_job_failure(job_id, FailureReason::Reported(reason)).await;
            }
            other => {
                let status = parse_job_status(other);
                if let Some(status) = status {
                    let _ = self
                        .store
                        .update_job(job_id, crate::store::JobUpdate::status(status))
                        .await;
                }
            }
        }
    }

    async fn handle_ready(&self, worker_id: &str) {
        if let Some(mut worker) = self.store.get_worker(worker_id).await {
            worker.status = WorkerStatus::Idle;
            worker.current_job_id = None;
            let _ = self.store.add_worker(worker).await;
        }
        self.sink.reschedule_pending().await;
    }

    /// Spawn the single background heartbeat monitor task (spec.md §4.B,
    /// §9 "single background task, not per worker"). The returned
    /// [`CancellationToken`] stops the sweep loop on shutdown.
    pub fn spawn_heartbeat_monitor(self: Arc<Self>) -> CancellationToken {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => self.sweep_stale_workers().await,
                }
            }
        });
        token
    }

    async fn sweep_stale_workers(&self) {
        let now = chrono::Utc::now();
        for worker in self.store.list_workers().await {
            let elapsed = now.signed_duration_since(worker.last_heartbeat);
            if elapsed.to_std().unwrap_or(Duration::ZERO) > HEARTBEAT_TIMEOUT {
                warn!(worker_id = %worker.id, "worker heartbeat timed out, ejecting");
                self.disconnect(&worker.id).await;
            }
        }
    }
}

fn parse_job_status(s: &str) -> Option<JobStatus> {
    match s {
        "pending" => Some(JobStatus::Pending),
        "running" => Some(JobStatus::Running),
        "retrying" => Some(JobStatus::Retrying),
        "skipped" => Some(JobStatus::Skipped),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStateStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        completions: Mutex<Vec<String>>,
        failures: Mutex<Vec<(String, String)>>,
        reschedules: AtomicUsize,
    }

    #[async_trait]
    impl JobEventSink for RecordingSink {
        async fn on_job_completion(&self, job_id: &str, _result: Option<Value>) {
            self.completions.lock().unwrap().push(job_id.to_string());
        }

        async fn on_job_failure(&self, job_id: &str, reason: FailureReason) {
            self.failures.lock().unwrap().push((job_id.to_string(), reason.to_string()));
        }

        async fn reschedule_pending(&self) {
            self.reschedules.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn register_message_adds_idle_worker() {
        let store = Arc::new(InMemoryStateStore::new());
        let sink = Arc::new(RecordingSink::default());
        let registry = WorkerRegistry::new(store.clone(), sink);

        let ack = registry
            .handle_message(
                "worker-1",
                WorkerMessage::Register {
                    capabilities: vec![JobType::Validation],
                },
            )
            .await;

        assert!(matches!(ack, Some(CoordinatorMessage::RegistrationAck { .. })));
        let worker = store.get_worker("worker-1").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn job_status_completed_invokes_sink() {
        let store = Arc::new(InMemoryStateStore::new());
        let sink = Arc::new(RecordingSink::default());
        let registry = WorkerRegistry::new(store, sink.clone());

        registry
            .handle_message(
                "worker-1",
                WorkerMessage::JobStatus {
                    job_id: "job-1".into(),
                    status: "completed".into(),
                    result: Some(serde_json::json!({"ok": true})),
                    worker_id: None,
                },
            )
            .await;

        assert_eq!(sink.completions.lock().unwrap().as_slice(), ["job-1"]);
    }

    #[tokio::test]
    async fn disconnect_with_in_flight_job_triggers_failure() {
        let store = Arc::new(InMemoryStateStore::new());
        let sink = Arc::new(RecordingSink::default());
        let registry = WorkerRegistry::new(store.clone(), sink.clone());

        store
            .add_worker(Worker::new("worker-1", HashSet::from([JobType::Processing])))
            .await
            .unwrap();
        store.assign_job("job-1", "worker-1").await.unwrap();

        registry.disconnect("worker-1").await;

        let failures = sink.failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "job-1");
        assert!(store.get_worker("worker-1").await.is_none());
    }

    #[tokio::test]
    async fn ready_message_marks_worker_idle_and_reschedules() {
        let store = Arc::new(InMemoryStateStore::new());
        let sink = Arc::new(RecordingSink::default());
        let registry = WorkerRegistry::new(store.clone(), sink.clone());

        let mut worker = Worker::new("worker-1", HashSet::from([JobType::Processing]));
        worker.status = WorkerStatus::Busy;
        worker.current_job_id = Some("job-1".into());
        store.add_worker(worker).await.unwrap();

        registry
            .handle_message("worker-1", WorkerMessage::Ready { worker_id: None })
            .await;

        let worker = store.get_worker("worker-1").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert_eq!(sink.reschedules.load(Ordering::SeqCst), 1);
    }
}
