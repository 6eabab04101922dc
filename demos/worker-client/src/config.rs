//! Environment-driven worker configuration, grounded on `worker/main.py`'s
//! `WORKER_ID` / `WORKER_CAPABILITIES` / `COORDINATOR_URL` env vars.

use conduit_core::JobType;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub capabilities: Vec<JobType>,
    pub coordinator_url: String,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let worker_id = std::env::var("WORKER_ID")
            .unwrap_or_else(|_| format!("worker-{}", &uuid::Uuid::now_v7().simple().to_string()[..8]));

        let capabilities = std::env::var("WORKER_CAPABILITIES")
            .unwrap_or_else(|_| "validation,processing,integration,cleanup".to_string())
            .split(',')
            .filter_map(|s| s.trim().parse::<JobType>().ok())
            .collect();

        let coordinator_url = std::env::var("COORDINATOR_URL")
            .unwrap_or_else(|_| "ws://localhost:8080/workers".to_string());

        Self {
            worker_id,
            capabilities,
            coordinator_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capabilities_cover_every_job_type() {
        std::env::remove_var("WORKER_ID");
        std::env::remove_var("WORKER_CAPABILITIES");
        std::env::remove_var("COORDINATOR_URL");
        let config = WorkerConfig::from_env();
        assert_eq!(config.capabilities.len(), 4);
    }
}
