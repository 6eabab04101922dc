//! Write-through durable tier (§4.A) backed by PostgreSQL.
//!
//! Kept strictly behind [`super::InMemoryStateStore`]: the engine never
//! knows persistence is enabled, reads never touch this module, and every
//! write here happens before the corresponding in-memory mutation is
//! applied (a failure here aborts the mutation, per spec.md §4.A).

use chrono::{DateTime, Utc};
use conduit_core::{Job, JobStatus, JobType, Worker, WorkerStatus, Workflow, WorkflowStatus};
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{error, instrument};

use super::JobUpdate;

/// Error type for the durable tier. A durable-write failure aborts the
/// calling [`super::StateStore`] mutation (spec.md §4.A, §7).
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid stored value: {0}")]
    InvalidData(String),
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        PersistenceError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Serialization(err.to_string())
    }
}

/// Everything loaded from durable storage during rebuild (§4.A, §7).
pub struct Snapshot {
    pub workflows: Vec<Workflow>,
    pub workers: Vec<Worker>,
    pub assignments: Vec<(String, String)>,
}

/// PostgreSQL-backed write-through persistence for the four tables named in
/// spec.md §6: workflows, jobs, workers, assignments.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using a `postgres://` connection string, as configured via
    /// the optional durable-storage environment input (spec.md §6).
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    /// Create the four tables if they don't already exist. Not a migration
    /// framework; intended for the zero-setup demo path. Real deployments
    /// should run `sqlx migrate` against a dedicated `migrations/` directory.
    #[instrument(skip(self))]
    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                current_jobs JSONB NOT NULL DEFAULT '[]',
                completed_jobs JSONB NOT NULL DEFAULT '[]',
                failed_jobs JSONB NOT NULL DEFAULT '[]',
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                job_type TEXT NOT NULL,
                parameters JSONB NOT NULL,
                status TEXT NOT NULL,
                worker_id TEXT,
                result JSONB,
                error TEXT,
                retry_count INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                on_success JSONB NOT NULL,
                on_failure JSONB NOT NULL,
                always_run BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                capabilities JSONB NOT NULL,
                current_job_id TEXT,
                last_heartbeat TIMESTAMPTZ NOT NULL,
                registered_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS assignments (
                job_id TEXT PRIMARY KEY,
                worker_id TEXT NOT NULL,
                assigned_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn load_all(&self) -> Result<Snapshot, PersistenceError> {
        let workflow_rows = sqlx::query(
            "SELECT id, name, status, current_jobs, completed_jobs, failed_jobs, created_at, updated_at FROM workflows",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut workflows = Vec::with_capacity(workflow_rows.len());
        for row in workflow_rows {
            let id: String = row.get("id");
            let job_rows = sqlx::query(
                r#"
                SELECT id, job_type, parameters, status, worker_id, result, error,
                       retry_count, max_retries, on_success, on_failure, always_run,
                       created_at, updated_at
                FROM jobs WHERE workflow_id = $1
                "#,
            )
            .bind(&id)
            .fetch_all(&self.pool)
            .await?;

            let jobs = job_rows
                .into_iter()
                .map(row_to_job)
                .collect::<Result<Vec<_>, _>>()?;

            workflows.push(Workflow {
                id,
                name: row.get("name"),
                status: parse_workflow_status(row.get("status"))?,
                jobs,
                current_jobs: json_to_id_set(row.get("current_jobs"))?,
                completed_jobs: json_to_id_set(row.get("completed_jobs"))?,
                failed_jobs: json_to_id_set(row.get("failed_jobs"))?,
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            });
        }

        let worker_rows =
            sqlx::query("SELECT id, status, capabilities, current_job_id, last_heartbeat, registered_at FROM workers")
                .fetch_all(&self.pool)
                .await?;

        let workers = worker_rows
            .into_iter()
            .map(row_to_worker)
            .collect::<Result<Vec<_>, _>>()?;

        let assignment_rows = sqlx::query("SELECT job_id, worker_id FROM assignments")
            .fetch_all(&self.pool)
            .await?;

        let assignments = assignment_rows
            .into_iter()
            .map(|row| (row.get::<String, _>("job_id"), row.get::<String, _>("worker_id")))
            .collect();

        Ok(Snapshot {
            workflows,
            workers,
            assignments,
        })
    }

    #[instrument(skip(self, workflow))]
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, status, current_jobs, completed_jobs, failed_jobs, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(workflow.status.to_string())
        .bind(id_set_to_json(&workflow.current_jobs))
        .bind(id_set_to_json(&workflow.completed_jobs))
        .bind(id_set_to_json(&workflow.failed_jobs))
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("failed to insert workflow: {e}");
            e
        })?;

        for job in &workflow.jobs {
            insert_job(&mut tx, &workflow.id, job).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(workflow_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn update_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
    ) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE workflows SET status = $2, updated_at = now() WHERE id = $1")
            .bind(workflow_id)
            .bind(status.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, job))]
    pub async fn save_job(&self, workflow_id: &str, job: &Job) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;
        insert_job(&mut tx, workflow_id, job).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_job(&self, job_id: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, update))]
    pub async fn update_job(
        &self,
        _workflow_id: &str,
        job_id: &str,
        update: &JobUpdate,
    ) -> Result<(), PersistenceError> {
        // Column-by-column COALESCE would require dynamic binding order, so
        // this loads-then-writes isn't attempted: every field the engine
        // tracks is always present on a JobUpdate built from JobUpdate::status.
        if let Some(status) = update.status {
            sqlx::query("UPDATE jobs SET status = $2, updated_at = now() WHERE id = $1")
                .bind(job_id)
                .bind(status.to_string())
                .execute(&self.pool)
                .await?;
        }
        if let Some(worker_id) = &update.worker_id {
            sqlx::query("UPDATE jobs SET worker_id = $2, updated_at = now() WHERE id = $1")
                .bind(job_id)
                .bind(worker_id)
                .execute(&self.pool)
                .await?;
        }
        if let Some(result) = &update.result {
            sqlx::query("UPDATE jobs SET result = $2, updated_at = now() WHERE id = $1")
                .bind(job_id)
                .bind(result)
                .execute(&self.pool)
                .await?;
        }
        if let Some(error_msg) = &update.error {
            sqlx::query("UPDATE jobs SET error = $2, updated_at = now() WHERE id = $1")
                .bind(job_id)
                .bind(error_msg)
                .execute(&self.pool)
                .await?;
        }
        if let Some(retry_count) = update.retry_count {
            sqlx::query("UPDATE jobs SET retry_count = $2, updated_at = now() WHERE id = $1")
                .bind(job_id)
                .bind(retry_count as i32)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self, worker))]
    pub async fn save_worker(&self, worker: &Worker) -> Result<(), PersistenceError> {
        let capabilities: Vec<String> = worker.capabilities.iter().map(|c| c.to_string()).collect();
        sqlx::query(
            r#"
            INSERT INTO workers (id, status, capabilities, current_job_id, last_heartbeat, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                capabilities = EXCLUDED.capabilities,
                current_job_id = EXCLUDED.current_job_id,
                last_heartbeat = EXCLUDED.last_heartbeat
            "#,
        )
        .bind(&worker.id)
        .bind(worker.status.to_string())
        .bind(serde_json::to_value(&capabilities)?)
        .bind(&worker.current_job_id)
        .bind(worker.last_heartbeat)
        .bind(worker.registered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_worker(&self, worker_id: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn save_assignment(&self, job_id: &str, worker_id: &str) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO assignments (job_id, worker_id, assigned_at)
            VALUES ($1, $2, now())
            ON CONFLICT (job_id) DO UPDATE SET worker_id = EXCLUDED.worker_id, assigned_at = now()
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_assignment(&self, job_id: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM assignments WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn insert_job(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    workflow_id: &str,
    job: &Job,
) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, workflow_id, job_type, parameters, status, worker_id, result, error,
            retry_count, max_retries, on_success, on_failure, always_run, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            worker_id = EXCLUDED.worker_id,
            result = EXCLUDED.result,
            error = EXCLUDED.error,
            retry_count = EXCLUDED.retry_count,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&job.id)
    .bind(workflow_id)
    .bind(job.job_type.to_string())
    .bind(serde_json::to_value(&job.parameters)?)
    .bind(job.status.to_string())
    .bind(&job.worker_id)
    .bind(&job.result)
    .bind(&job.error)
    .bind(job.retry_count as i32)
    .bind(job.max_retries as i32)
    .bind(serde_json::to_value(&job.on_success)?)
    .bind(serde_json::to_value(&job.on_failure)?)
    .bind(job.always_run)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_job(row: sqlx::postgres::PgRow) -> Result<Job, PersistenceError> {
    let on_success: serde_json::Value = row.get("on_success");
    let on_failure: serde_json::Value = row.get("on_failure");
    let parameters: serde_json::Value = row.get("parameters");

    Ok(Job {
        id: row.get("id"),
        job_type: parse_job_type(row.get("job_type"))?,
        parameters: serde_json::from_value(parameters)?,
        status: parse_job_status(row.get("status"))?,
        worker_id: row.get("worker_id"),
        result: row.get("result"),
        error: row.get("error"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        max_retries: row.get::<i32, _>("max_retries") as u32,
        on_success: serde_json::from_value(on_success)?,
        on_failure: serde_json::from_value(on_failure)?,
        always_run: row.get("always_run"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_worker(row: sqlx::postgres::PgRow) -> Result<Worker, PersistenceError> {
    let capabilities: Vec<String> = serde_json::from_value(row.get("capabilities"))?;
    let capabilities = capabilities
        .into_iter()
        .map(|c| parse_job_type(c))
        .collect::<Result<HashSet<JobType>, _>>()?;

    Ok(Worker {
        id: row.get("id"),
        status: parse_worker_status(row.get("status"))?,
        capabilities,
        current_job_id: row.get("current_job_id"),
        last_heartbeat: row.get::<DateTime<Utc>, _>("last_heartbeat"),
        registered_at: row.get::<DateTime<Utc>, _>("registered_at"),
    })
}

fn id_set_to_json(ids: &HashSet<String>) -> serde_json::Value {
    serde_json::Value::Array(ids.iter().cloned().map(serde_json::Value::String).collect())
}

fn json_to_id_set(value: serde_json::Value) -> Result<HashSet<String>, PersistenceError> {
    let ids: Vec<String> = serde_json::from_value(value)?;
    Ok(ids.into_iter().collect())
}

fn parse_job_type(s: String) -> Result<JobType, PersistenceError> {
    JobType::from_str(&s).map_err(PersistenceError::InvalidData)
}

fn parse_job_status(s: String) -> Result<JobStatus, PersistenceError> {
    match s.as_str() {
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        "failed" => Ok(JobStatus::Failed),
        "retrying" => Ok(JobStatus::Retrying),
        "skipped" => Ok(JobStatus::Skipped),
        other => Err(PersistenceError::InvalidData(format!("unknown job status: {other}"))),
    }
}

fn parse_worker_status(s: String) -> Result<WorkerStatus, PersistenceError> {
    match s.as_str() {
        "idle" => Ok(WorkerStatus::Idle),
        "busy" => Ok(WorkerStatus::Busy),
        "offline" => Ok(WorkerStatus::Offline),
        other => Err(PersistenceError::InvalidData(format!("unknown worker status: {other}"))),
    }
}

fn parse_workflow_status(s: String) -> Result<WorkflowStatus, PersistenceError> {
    match s.as_str() {
        "pending" => Ok(WorkflowStatus::Pending),
        "running" => Ok(WorkflowStatus::Running),
        "completed" => Ok(WorkflowStatus::Completed),
        "failed" => Ok(WorkflowStatus::Failed),
        "cancelled" => Ok(WorkflowStatus::Cancelled),
        other => Err(PersistenceError::InvalidData(format!("unknown workflow status: {other}"))),
    }
}
