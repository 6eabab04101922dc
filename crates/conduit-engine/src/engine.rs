//! Workflow engine (§4.D): graph construction, successor triggering, retry
//! and always-run policy, skip computation, and workflow termination.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{info, instrument, warn};

use conduit_core::{Job, JobStatus, Workflow, WorkflowStatus};

use crate::registry::{FailureReason, JobEventSink};
use crate::scheduler::Dispatcher;
use crate::store::{JobUpdate, StateStore, StoreError};

/// Errors surfaced synchronously at graph-construction time (spec.md §7,
/// "Definition errors"). A workflow rejected with one of these is never
/// created or started.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("job '{from}' references non-existent job '{to}'")]
    InvalidReference { from: String, to: String },

    #[error("duplicate job id: {0}")]
    DuplicateJobId(String),

    #[error("circular dependency detected at job '{0}'")]
    CircularDependency(String),

    #[error("always_run job '{0}' must not declare on_success/on_failure successors")]
    AlwaysRunHasSuccessors(String),
}

/// Errors surfaced by operations on an already-known workflow (not a
/// construction-time failure, but not a normal transition either).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow '{0}' is not pending, cannot start")]
    NotPending(String),

    #[error("workflow '{0}' is not cancellable from its current status")]
    NotCancellable(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reverse-adjacency dependency graph for one workflow: `deps[c]` is the set
/// of job ids that list `c` in their `on_success`/`on_failure` (spec.md
/// §4.D). Cached per workflow id while the workflow is in flight.
#[derive(Debug, Clone, Default)]
struct DependencyGraph {
    deps: HashMap<String, HashSet<String>>,
    entries: Vec<String>,
}

impl DependencyGraph {
    fn is_entry(&self, job_id: &str) -> bool {
        self.deps.get(job_id).map(|d| d.is_empty()).unwrap_or(true)
    }
}

/// Build the reverse-adjacency graph for a job list and validate it:
/// references must resolve, ids must be unique, the graph must be acyclic,
/// and `always_run` jobs may not declare successors (spec.md §4.D, and the
/// second Open Question in §9, resolved per SPEC_FULL.md §13).
fn build_graph(jobs: &[Job]) -> Result<DependencyGraph, DefinitionError> {
    let mut seen = HashSet::new();
    for job in jobs {
        if !seen.insert(job.id.clone()) {
            return Err(DefinitionError::DuplicateJobId(job.id.clone()));
        }
    }

    let mut deps: HashMap<String, HashSet<String>> = jobs.iter().map(|j| (j.id.clone(), HashSet::new())).collect();

    for job in jobs {
        if job.always_run && (!job.on_success.is_empty() || !job.on_failure.is_empty()) {
            return Err(DefinitionError::AlwaysRunHasSuccessors(job.id.clone()));
        }

        for child in job.on_success.iter().chain(job.on_failure.iter()) {
            let entry = deps.get_mut(child).ok_or_else(|| DefinitionError::InvalidReference {
                from: job.id.clone(),
                to: child.clone(),
            })?;
            entry.insert(job.id.clone());
        }
    }

    detect_cycle(jobs, &deps)?;

    let entries = jobs
        .iter()
        .filter(|j| deps.get(&j.id).map(|d| d.is_empty()).unwrap_or(true))
        .map(|j| j.id.clone())
        .collect();

    Ok(DependencyGraph { deps, entries })
}

/// Standard three-colour DFS cycle detection over the forward edges
/// (successors), rejecting on the first back-edge found (spec.md §9: "not
/// Tarjan — we do not need SCCs, just acyclicity").
fn detect_cycle(jobs: &[Job], deps: &HashMap<String, HashSet<String>>) -> Result<(), DefinitionError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let forward: HashMap<&str, Vec<&str>> = {
        let mut map: HashMap<&str, Vec<&str>> = jobs.iter().map(|j| (j.id.as_str(), Vec::new())).collect();
        for (child, parents) in deps {
            for parent in parents {
                map.entry(parent.as_str()).or_default().push(child.as_str());
            }
        }
        map
    };

    let mut color: HashMap<&str, Color> = jobs.iter().map(|j| (j.id.as_str(), Color::White)).collect();

    fn visit<'a>(
        node: &'a str,
        forward: &HashMap<&'a str, Vec<&'a str>>,
        color: &mut HashMap<&'a str, Color>,
    ) -> Result<(), DefinitionError> {
        color.insert(node, Color::Gray);
        if let Some(children) = forward.get(node) {
            for &child in children {
                match color.get(child).copied().unwrap_or(Color::White) {
                    Color::White => visit(child, forward, color)?,
                    Color::Gray => return Err(DefinitionError::CircularDependency(child.to_string())),
                    Color::Black => {}
                }
            }
        }
        color.insert(node, Color::Black);
        Ok(())
    }

    for job in jobs {
        if color.get(job.id.as_str()).copied().unwrap_or(Color::White) == Color::White {
            visit(&job.id, &forward, &mut color)?;
        }
    }

    Ok(())
}

/// Validate a workflow definition without touching the store — used both by
/// the API layer before `add_workflow` and internally before `start`.
pub fn validate_definition(jobs: &[Job]) -> Result<(), DefinitionError> {
    build_graph(jobs).map(|_| ())
}

/// The workflow execution engine (spec.md §4.D). Holds no workflow state of
/// its own beyond a per-workflow dependency-graph cache; the state store
/// remains the single source of truth.
pub struct WorkflowEngine {
    store: Arc<dyn StateStore>,
    dispatcher: Arc<dyn Dispatcher>,
    graphs: DashMap<String, DependencyGraph>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn StateStore>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            graphs: DashMap::new(),
        }
    }

    fn graph_for(&self, workflow: &Workflow) -> Result<DependencyGraph, DefinitionError> {
        if let Some(graph) = self.graphs.get(&workflow.id) {
            return Ok(graph.clone());
        }
        let graph = build_graph(&workflow.jobs)?;
        self.graphs.insert(workflow.id.clone(), graph.clone());
        Ok(graph)
    }

    fn drop_graph(&self, workflow_id: &str) {
        self.graphs.remove(workflow_id);
    }

    /// Start a `pending` workflow: build (and cache) its graph, compute
    /// entries, and schedule each in definition order (spec.md §4.D
    /// "Starting a workflow").
    #[instrument(skip(self))]
    pub async fn start_workflow(&self, workflow_id: &str) -> Result<(), EngineError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        if workflow.status != WorkflowStatus::Pending {
            return Err(EngineError::NotPending(workflow_id.to_string()));
        }

        let graph = self.graph_for(&workflow)?;

        if graph.entries.is_empty() {
            self.store
                .update_workflow_status(workflow_id, WorkflowStatus::Failed)
                .await?;
            self.drop_graph(workflow_id);
            return Ok(());
        }

        self.store
            .update_workflow_status(workflow_id, WorkflowStatus::Running)
            .await?;

        for entry in &graph.entries {
            self.schedule_job(workflow_id, entry).await;
        }

        Ok(())
    }

    /// Place one job with the scheduler if it isn't already in flight or
    /// terminal (spec.md §4.D "Scheduling one job").
    #[instrument(skip(self))]
    async fn schedule_job(&self, workflow_id: &str, job_id: &str) {
        let Some(workflow) = self.store.get_workflow(workflow_id).await else {
            return;
        };
        let Some(job) = workflow.job(job_id) else {
            warn!(%workflow_id, %job_id, "schedule_job called for unknown job");
            return;
        };

        if job.is_terminal() || job.status == JobStatus::Running {
            return;
        }

        let job_type = job.job_type;
        let parameters = serde_json::to_value(&job.parameters).unwrap_or(Value::Null);

        let _ = self
            .store
            .update_job(job_id, JobUpdate::status(JobStatus::Running))
            .await;

        match self.dispatcher.dispatch(job_id, job_type, parameters).await {
            Some(worker_id) => {
                let _ = self
                    .store
                    .update_job(job_id, JobUpdate::default().with_worker_id(Some(worker_id)))
                    .await;
            }
            None => {
                // Leaves the job pending, awaiting a future `ready` event
                // (spec.md §4.C step 2, §4.D).
                let _ = self
                    .store
                    .update_job(job_id, JobUpdate::status(JobStatus::Pending))
                    .await;
            }
        }
    }

    /// A non-entry, non-`always_run` job is schedulable iff *every*
    /// predecessor that lists it (in `on_success` or `on_failure`) has
    /// resolved towards it — completed, for a predecessor that reaches it via
    /// `on_success`; failed, for one that reaches it via `on_failure` (spec.md
    /// §4.D "Scheduling precondition" — the AND-join reading resolved in
    /// SPEC_FULL.md §13, required so a fan-in aggregate job waits for every
    /// parallel branch rather than firing on the first). Entry and
    /// `always_run` jobs are always schedulable on demand.
    fn is_schedulable(&self, workflow: &Workflow, graph: &DependencyGraph, job: &Job) -> bool {
        if !matches!(job.status, JobStatus::Pending | JobStatus::Retrying) {
            return false;
        }
        if job.always_run || graph.is_entry(&job.id) {
            return true;
        }

        let Some(predecessors) = graph.deps.get(&job.id) else {
            return false;
        };
        if predecessors.is_empty() {
            return false;
        }

        predecessors.iter().all(|pred_id| {
            let Some(pred) = workflow.job(pred_id) else { return false };
            (workflow.completed_jobs.contains(pred_id) && pred.on_success.contains(&job.id))
                || (workflow.failed_jobs.contains(pred_id) && pred.on_failure.contains(&job.id))
        })
    }

    /// `handle_job_completion` (spec.md §4.D "Completion").
    #[instrument(skip(self, result))]
    async fn complete_job(&self, workflow_id: &str, job_id: &str, result: Option<Value>) {
        let _ = self
            .store
            .update_job(
                job_id,
                JobUpdate::status(JobStatus::Completed)
                    .with_result(result)
                    .with_worker_id(None),
            )
            .await;
        let _ = self.store.unassign_job(job_id).await;

        let Some(workflow) = self.store.get_workflow(workflow_id).await else {
            return;
        };
        let Some(job) = workflow.job(job_id).cloned() else { return };

        for successor in &job.on_success {
            self.try_schedule_if_ready(workflow_id, successor).await;
        }

        self.evaluate_termination(workflow_id).await;
    }

    /// `handle_job_failure` (spec.md §4.D "Failure").
    #[instrument(skip(self))]
    async fn fail_job(&self, workflow_id: &str, job_id: &str, reason: FailureReason) {
        let Some(workflow) = self.store.get_workflow(workflow_id).await else {
            return;
        };
        let Some(job) = workflow.job(job_id).cloned() else { return };

        // Idempotence (R1): a duplicate/late report against an already
        // terminal job is a no-op.
        if job.is_terminal() {
            return;
        }

        let error = reason.to_string();

        if job.retry_count < job.max_retries {
            let _ = self
                .store
                .update_job(
                    job_id,
                    JobUpdate::status(JobStatus::Retrying)
                        .with_retry_count(job.retry_count + 1)
                        .with_worker_id(None)
                        .with_error(Some(error)),
                )
                .await;
            let _ = self.store.unassign_job(job_id).await;
            self.schedule_job(workflow_id, job_id).await;
            return;
        }

        let _ = self
            .store
            .update_job(
                job_id,
                JobUpdate::status(JobStatus::Failed)
                    .with_error(Some(error))
                    .with_worker_id(None),
            )
            .await;
        let _ = self.store.unassign_job(job_id).await;

        if job.on_failure.is_empty() {
            self.fail_workflow(workflow_id).await;
            return;
        }

        for successor in &job.on_failure {
            self.try_schedule_if_ready(workflow_id, successor).await;
        }

        self.evaluate_termination(workflow_id).await;
    }

    async fn try_schedule_if_ready(&self, workflow_id: &str, job_id: &str) {
        let Some(workflow) = self.store.get_workflow(workflow_id).await else {
            return;
        };
        let Ok(graph) = self.graph_for(&workflow) else { return };
        let Some(job) = workflow.job(job_id) else { return };

        if self.is_schedulable(&workflow, &graph, job) {
            self.schedule_job(workflow_id, job_id).await;
        }
    }

    /// Explicit workflow failure: no `on_failure` successors for a
    /// non-retryable failure (spec.md §4.D "Workflow failure (explicit)").
    async fn fail_workflow(&self, workflow_id: &str) {
        let _ = self
            .store
            .update_workflow_status(workflow_id, WorkflowStatus::Failed)
            .await;
        self.run_always_run_pass(workflow_id).await;
        self.drop_graph(workflow_id);
    }

    /// Termination evaluation (spec.md §4.D "Termination evaluation"),
    /// invoked after every status change.
    #[instrument(skip(self))]
    async fn evaluate_termination(&self, workflow_id: &str) {
        let Some(workflow) = self.store.get_workflow(workflow_id).await else {
            return;
        };
        if workflow.status.is_terminal() {
            return;
        }
        let Ok(graph) = self.graph_for(&workflow) else { return };

        if !workflow.current_jobs.is_empty() {
            return;
        }

        let any_schedulable = workflow
            .jobs
            .iter()
            .filter(|j| !j.always_run)
            .any(|j| self.is_schedulable(&workflow, &graph, j));
        if any_schedulable {
            return;
        }

        // Skip pass: every non-terminal, non-running, non-always_run,
        // non-schedulable job is skipped.
        for job in &workflow.jobs {
            if job.always_run || job.is_terminal() || job.status == JobStatus::Running {
                continue;
            }
            if self.is_schedulable(&workflow, &graph, job) {
                continue;
            }
            let _ = self
                .store
                .update_job(&job.id, JobUpdate::status(JobStatus::Skipped))
                .await;
        }

        let scheduled_any_always_run = self.run_always_run_pass(workflow_id).await;
        if scheduled_any_always_run {
            // Workflow is back in flight; termination re-evaluates when
            // those jobs complete.
            return;
        }

        let Some(workflow) = self.store.get_workflow(workflow_id).await else {
            return;
        };
        let final_status = if !workflow.failed_jobs.is_empty() {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };
        let _ = self.store.update_workflow_status(workflow_id, final_status).await;
        self.drop_graph(workflow_id);
        info!(%workflow_id, status = %final_status, "workflow terminated");
    }

    /// Always-run pass (spec.md §4.D "Termination evaluation" step 2):
    /// schedule every `always_run` job not already completed or running.
    /// Returns whether any job was actually scheduled.
    async fn run_always_run_pass(&self, workflow_id: &str) -> bool {
        let Some(workflow) = self.store.get_workflow(workflow_id).await else {
            return false;
        };
        let mut scheduled = false;
        for job in &workflow.jobs {
            if job.always_run && !matches!(job.status, JobStatus::Completed | JobStatus::Running) {
                self.schedule_job(workflow_id, &job.id).await;
                scheduled = true;
            }
        }
        scheduled
    }

    /// `cancel_workflow` (spec.md §4.D "Cancellation").
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<(), EngineError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        if !matches!(workflow.status, WorkflowStatus::Pending | WorkflowStatus::Running) {
            return Err(EngineError::NotCancellable(workflow_id.to_string()));
        }

        self.store
            .update_workflow_status(workflow_id, WorkflowStatus::Cancelled)
            .await?;

        for job_id in workflow.current_jobs.clone() {
            if let Some(job) = workflow.job(&job_id) {
                if job.status == JobStatus::Running {
                    let _ = self
                        .store
                        .update_job(
                            &job_id,
                            JobUpdate::status(JobStatus::Failed)
                                .with_error(Some(FailureReason::WorkflowCancelled.to_string()))
                                .with_worker_id(None),
                        )
                        .await;
                    let _ = self.store.unassign_job(&job_id).await;
                }
            }
        }

        self.run_always_run_pass(workflow_id).await;
        self.drop_graph(workflow_id);
        info!(%workflow_id, "workflow cancelled");
        Ok(())
    }

    /// Reattempt scheduling for every pending/retrying job across every
    /// `running` workflow, in response to a worker's `ready` message
    /// (spec.md §4.B).
    #[instrument(skip(self))]
    pub async fn reschedule_pending_jobs(&self) {
        for workflow in self.store.list_workflows().await {
            if workflow.status != WorkflowStatus::Running {
                continue;
            }
            let Ok(graph) = self.graph_for(&workflow) else { continue };
            for job in &workflow.jobs {
                if matches!(job.status, JobStatus::Pending | JobStatus::Retrying)
                    && self.is_schedulable(&workflow, &graph, job)
                {
                    self.schedule_job(&workflow.id, &job.id).await;
                }
            }
        }
    }

    /// Restart reconciliation (spec.md §7): after a rebuild from durable
    /// storage, every job left `running`/`retrying` lost its worker. Feed
    /// each through the failure handler so retry policy takes over.
    #[instrument(skip(self))]
    pub async fn reconcile_after_restart(&self) {
        for workflow in self.store.list_workflows().await {
            for job in &workflow.jobs {
                if matches!(job.status, JobStatus::Running | JobStatus::Retrying) {
                    self.fail_job(&workflow.id, &job.id, FailureReason::CoordinatorRestart).await;
                }
            }
        }
    }
}

#[async_trait]
impl JobEventSink for WorkflowEngine {
    async fn on_job_completion(&self, job_id: &str, result: Option<Value>) {
        let Some(workflow_id) = self.store.workflow_id_for_job(job_id).await else {
            warn!(%job_id, "job_status(completed) for unknown job");
            return;
        };
        self.complete_job(&workflow_id, job_id, result).await;
    }

    async fn on_job_failure(&self, job_id: &str, reason: FailureReason) {
        let Some(workflow_id) = self.store.workflow_id_for_job(job_id).await else {
            warn!(%job_id, "job_status(failed) for unknown job");
            return;
        };
        self.fail_job(&workflow_id, job_id, reason).await;
    }

    async fn reschedule_pending(&self) {
        self.reschedule_pending_jobs().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStateStore;
    use conduit_core::{JobType, Worker};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysAssigns {
        store: Arc<dyn StateStore>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Dispatcher for AlwaysAssigns {
        async fn dispatch(&self, job_id: &str, _job_type: JobType, _parameters: Value) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.store.assign_job(job_id, "worker-1").await;
            Some("worker-1".to_string())
        }
    }

    struct NeverAssigns;

    #[async_trait]
    impl Dispatcher for NeverAssigns {
        async fn dispatch(&self, _job_id: &str, _job_type: JobType, _parameters: Value) -> Option<String> {
            None
        }
    }

    fn linear_workflow() -> Workflow {
        let mut a = Job::new("a", JobType::Validation);
        a.on_success = vec!["b".into()];
        let b = Job::new("b", JobType::Processing);
        Workflow::new("wf-1", "linear", vec![a, b])
    }

    fn branch_with_cleanup_workflow() -> Workflow {
        let mut a = Job::new("a", JobType::Validation);
        a.on_success = vec!["b".into()];
        a.on_failure = vec!["c".into()];
        let b = Job::new("b", JobType::Processing);
        let mut c = Job::new("c", JobType::Cleanup);
        c.always_run = true;
        Workflow::new("wf-2", "branch", vec![a, b, c])
    }

    async fn setup(workflow: Workflow) -> (Arc<InMemoryStateStore>, Arc<WorkflowEngine>) {
        let store = Arc::new(InMemoryStateStore::new());
        store.add_worker(Worker::new("worker-1", HashSet::from([JobType::Validation, JobType::Processing, JobType::Cleanup, JobType::Integration]))).await.unwrap();
        store.add_workflow(workflow).await.unwrap();
        let dispatcher = Arc::new(AlwaysAssigns {
            store: store.clone(),
            calls: AtomicUsize::new(0),
        });
        let engine = Arc::new(WorkflowEngine::new(store.clone(), dispatcher));
        (store, engine)
    }

    #[tokio::test]
    async fn linear_workflow_completes() {
        let (store, engine) = setup(linear_workflow()).await;
        engine.start_workflow("wf-1").await.unwrap();

        engine.on_job_completion("a", Some(serde_json::json!({}))).await;
        engine.on_job_completion("b", Some(serde_json::json!({}))).await;

        let wf = store.get_workflow("wf-1").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(wf.completed_jobs, HashSet::from(["a".to_string(), "b".to_string()]));
        assert!(wf.failed_jobs.is_empty());
    }

    #[tokio::test]
    async fn branch_with_cleanup_on_success_completes() {
        let (store, engine) = setup(branch_with_cleanup_workflow()).await;
        engine.start_workflow("wf-2").await.unwrap();

        engine.on_job_completion("a", Some(serde_json::json!({}))).await;
        engine.on_job_completion("b", Some(serde_json::json!({}))).await;

        // `c` is always_run: the termination pass schedules it but stays
        // Running until a worker reports it done, so the workflow does too.
        let wf = store.get_workflow("wf-2").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Running);
        assert_eq!(wf.job("c").unwrap().status, JobStatus::Running);

        engine.on_job_completion("c", Some(serde_json::json!({}))).await;

        let wf = store.get_workflow("wf-2").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(
            wf.completed_jobs,
            HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[tokio::test]
    async fn branch_failure_path_skips_success_branch() {
        let (store, engine) = setup(branch_with_cleanup_workflow()).await;
        engine.start_workflow("wf-2").await.unwrap();

        for _ in 0..=3 {
            engine
                .on_job_failure("a", FailureReason::Reported("boom".into()))
                .await;
        }

        // `c` is scheduled immediately (always_run, reached via a's
        // on_failure) and termination evaluation defers to it; the skip
        // pass for `b` hasn't run yet because `current_jobs` isn't empty.
        let wf = store.get_workflow("wf-2").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Running);
        assert_eq!(wf.job("b").unwrap().status, JobStatus::Pending);
        assert_eq!(wf.job("c").unwrap().status, JobStatus::Running);

        engine.on_job_completion("c", Some(serde_json::json!({}))).await;

        let wf = store.get_workflow("wf-2").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(wf.failed_jobs, HashSet::from(["a".to_string()]));
        assert_eq!(wf.completed_jobs, HashSet::from(["c".to_string()]));
        assert_eq!(wf.job("b").unwrap().status, JobStatus::Skipped);
    }

    #[tokio::test]
    async fn parallel_join_schedules_aggregate_once() {
        let mut s = Job::new("s", JobType::Validation);
        s.on_success = vec!["p1".into(), "p2".into(), "p3".into()];
        let mut p1 = Job::new("p1", JobType::Processing);
        p1.on_success = vec!["agg".into()];
        let mut p2 = Job::new("p2", JobType::Processing);
        p2.on_success = vec!["agg".into()];
        let mut p3 = Job::new("p3", JobType::Processing);
        p3.on_success = vec!["agg".into()];
        let agg = Job::new("agg", JobType::Integration);
        let workflow = Workflow::new("wf-3", "join", vec![s, p1, p2, p3, agg]);

        let (store, engine) = setup(workflow).await;
        engine.start_workflow("wf-3").await.unwrap();
        engine.on_job_completion("s", Some(serde_json::json!({}))).await;

        engine.on_job_completion("p1", Some(serde_json::json!({}))).await;
        let wf = store.get_workflow("wf-3").await.unwrap();
        assert_eq!(wf.job("agg").unwrap().status, JobStatus::Pending);

        engine.on_job_completion("p2", Some(serde_json::json!({}))).await;
        let wf = store.get_workflow("wf-3").await.unwrap();
        assert_eq!(wf.job("agg").unwrap().status, JobStatus::Pending);

        engine.on_job_completion("p3", Some(serde_json::json!({}))).await;
        let wf = store.get_workflow("wf-3").await.unwrap();
        assert_eq!(wf.job("agg").unwrap().status, JobStatus::Running);

        engine.on_job_completion("agg", Some(serde_json::json!({}))).await;
        let wf = store.get_workflow("wf-3").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(wf.completed_jobs.len(), 5);
    }

    /// Direct regression test for the AND-join decision in SPEC_FULL.md §13:
    /// an aggregate with three parallel predecessors must not become
    /// schedulable until all three have completed, not just the first.
    #[tokio::test]
    async fn aggregate_waits_for_all_parallel_predecessors() {
        let mut split = Job::new("split", JobType::Processing);
        split.on_success = vec!["process-a".into(), "process-b".into(), "process-c".into()];
        let mut pa = Job::new("process-a", JobType::Processing);
        pa.on_success = vec!["aggregate".into()];
        let mut pb = Job::new("process-b", JobType::Processing);
        pb.on_success = vec!["aggregate".into()];
        let mut pc = Job::new("process-c", JobType::Processing);
        pc.on_success = vec!["aggregate".into()];
        let aggregate = Job::new("aggregate", JobType::Processing);
        let workflow = Workflow::new(
            "parallel-test",
            "Parallel Test",
            vec![split, pa, pb, pc, aggregate],
        );

        let (store, engine) = setup(workflow).await;
        engine.start_workflow("parallel-test").await.unwrap();
        engine.on_job_completion("split", Some(serde_json::json!({}))).await;

        engine.on_job_completion("process-a", Some(serde_json::json!({}))).await;
        let wf = store.get_workflow("parallel-test").await.unwrap();
        assert!(!wf.current_jobs.contains("aggregate"));

        engine.on_job_completion("process-b", Some(serde_json::json!({}))).await;
        let wf = store.get_workflow("parallel-test").await.unwrap();
        assert!(!wf.current_jobs.contains("aggregate"));

        engine.on_job_completion("process-c", Some(serde_json::json!({}))).await;
        let wf = store.get_workflow("parallel-test").await.unwrap();
        assert!(wf.current_jobs.contains("aggregate"));
        assert_eq!(wf.job("aggregate").unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn worker_failure_retries_job() {
        let (store, engine) = setup(linear_workflow()).await;
        engine.start_workflow("wf-1").await.unwrap();

        engine
            .on_job_failure("a", FailureReason::WorkerDisconnected { worker_id: "worker-1".into() })
            .await;

        let wf = store.get_workflow("wf-1").await.unwrap();
        let a = wf.job("a").unwrap();
        assert_eq!(a.retry_count, 1);
        assert!(matches!(a.status, JobStatus::Running | JobStatus::Retrying | JobStatus::Pending));
    }

    #[tokio::test]
    async fn cancellation_marks_running_job_failed_and_is_idempotent() {
        let (store, engine) = setup(linear_workflow()).await;
        engine.start_workflow("wf-1").await.unwrap();

        engine.cancel_workflow("wf-1").await.unwrap();
        let wf = store.get_workflow("wf-1").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Cancelled);
        assert_eq!(wf.job("a").unwrap().status, JobStatus::Failed);
        assert_eq!(wf.job("a").unwrap().error.as_deref(), Some("workflow cancelled"));

        // R1/idempotence: a late completion report against the now-terminal
        // job is a no-op and does not revive the workflow.
        engine.on_job_completion("a", Some(serde_json::json!({}))).await;
        let wf = store.get_workflow("wf-1").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Cancelled);
    }

    #[tokio::test]
    async fn duplicate_completion_is_idempotent() {
        let (store, engine) = setup(linear_workflow()).await;
        engine.start_workflow("wf-1").await.unwrap();
        engine.on_job_completion("a", Some(serde_json::json!({}))).await;
        engine.on_job_completion("b", Some(serde_json::json!({}))).await;

        let before = store.get_workflow("wf-1").await.unwrap();
        engine.on_job_completion("b", Some(serde_json::json!({}))).await;
        let after = store.get_workflow("wf-1").await.unwrap();

        assert_eq!(before.status, after.status);
        assert_eq!(before.completed_jobs, after.completed_jobs);
    }

    #[tokio::test]
    async fn start_workflow_with_no_jobs_fails_immediately() {
        let store = Arc::new(InMemoryStateStore::new());
        let workflow = Workflow::new("wf-empty", "empty", vec![]);
        store.add_workflow(workflow).await.unwrap();
        let dispatcher = Arc::new(NeverAssigns);
        let engine = WorkflowEngine::new(store.clone(), dispatcher);

        engine.start_workflow("wf-empty").await.unwrap();
        let wf = store.get_workflow("wf-empty").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
    }

    #[test]
    fn build_graph_rejects_cycles() {
        let mut a = Job::new("a", JobType::Validation);
        a.on_success = vec!["b".into()];
        let mut b = Job::new("b", JobType::Processing);
        b.on_success = vec!["a".into()];
        let err = build_graph(&[a, b]).unwrap_err();
        assert!(matches!(err, DefinitionError::CircularDependency(_)));
    }

    #[test]
    fn build_graph_rejects_dangling_reference() {
        let mut a = Job::new("a", JobType::Validation);
        a.on_success = vec!["ghost".into()];
        let err = build_graph(&[a]).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidReference { .. }));
    }

    #[test]
    fn build_graph_rejects_always_run_with_successors() {
        let mut c = Job::new("c", JobType::Cleanup);
        c.always_run = true;
        c.on_success = vec!["d".into()];
        let d = Job::new("d", JobType::Cleanup);
        let err = build_graph(&[c, d]).unwrap_err();
        assert!(matches!(err, DefinitionError::AlwaysRunHasSuccessors(_)));
    }
}
