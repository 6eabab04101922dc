//! Best-effort read cache consulted only on memory miss (§4.A).
//!
//! Cache failures are logged and swallowed; they never fail the calling
//! store operation (spec.md §7: "a cache failure is logged and ignored").

use async_trait::async_trait;
use conduit_core::{Job, Workflow};
use redis::AsyncCommands;
use tracing::warn;

#[async_trait]
pub trait CacheTier: Send + Sync {
    async fn get_workflow(&self, workflow_id: &str) -> Option<Workflow>;
    async fn put_workflow(&self, workflow: &Workflow);
    async fn invalidate_workflow(&self, workflow_id: &str);

    async fn get_job(&self, job_id: &str) -> Option<Job>;
    async fn put_job(&self, job: &Job);
    async fn invalidate_job(&self, job_id: &str);
}

/// Redis-backed implementation. Connection errors degrade to cache misses
/// rather than propagating — the memory store is always the fallback.
pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    pub fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }

    async fn conn(&self) -> Option<redis::aio::MultiplexedConnection> {
        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => Some(conn),
            Err(err) => {
                warn!(%err, "cache connection failed");
                None
            }
        }
    }
}

#[async_trait]
impl CacheTier for RedisCache {
    async fn get_workflow(&self, workflow_id: &str) -> Option<Workflow> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .hget("cache:workflows", workflow_id)
            .await
            .map_err(|err| warn!(%err, "cache get_workflow failed"))
            .ok()?;
        raw.and_then(|s| serde_json::from_str(&s).ok())
    }

    async fn put_workflow(&self, workflow: &Workflow) {
        let Some(mut conn) = self.conn().await else { return };
        let Ok(raw) = serde_json::to_string(workflow) else { return };
        let result: Result<(), _> = conn.hset("cache:workflows", &workflow.id, raw).await;
        if let Err(err) = result {
            warn!(%err, "cache put_workflow failed");
        }
    }

    async fn invalidate_workflow(&self, workflow_id: &str) {
        let Some(mut conn) = self.conn().await else { return };
        let result: Result<(), _> = conn.hdel("cache:workflows", workflow_id).await;
        if let Err(err) = result {
            warn!(%err, "cache invalidate_workflow failed");
        }
    }

    async fn get_job(&self, job_id: &str) -> Option<Job> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .hget("cache:jobs", job_id)
            .await
            .map_err(|err| warn!(%err, "cache get_job failed"))
            .ok()?;
        raw.and_then(|s| serde_json::from_str(&s).ok())
    }

    async fn put_job(&self, job: &Job) {
        let Some(mut conn) = self.conn().await else { return };
        let Ok(raw) = serde_json::to_string(job) else { return };
        let result: Result<(), _> = conn.hset("cache:jobs", &job.id, raw).await;
        if let Err(err) = result {
            warn!(%err, "cache put_job failed");
        }
    }

    async fn invalidate_job(&self, job_id: &str) {
        let Some(mut conn) = self.conn().await else { return };
        let result: Result<(), _> = conn.hdel("cache:jobs", job_id).await;
        if let Err(err) = result {
            warn!(%err, "cache invalidate_job failed");
        }
    }
}
