//! Worker type: a capability-declaring remote process addressed by a stable id

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::job::JobType;

/// Status of a registered worker. Invariant (P2, §3): `status = Busy` iff
/// `current_job_id` is `Some`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub status: WorkerStatus,
    pub capabilities: HashSet<JobType>,
    pub current_job_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(id: impl Into<String>, capabilities: HashSet<JobType>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: WorkerStatus::Idle,
            capabilities,
            current_job_id: None,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn can_run(&self, job_type: JobType) -> bool {
        self.capabilities.contains(&job_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_worker_is_idle_with_no_current_job() {
        let w = Worker::new("worker-1", HashSet::from([JobType::Validation]));
        assert_eq!(w.status, WorkerStatus::Idle);
        assert!(w.current_job_id.is_none());
    }

    #[test]
    fn can_run_checks_capability_membership() {
        let w = Worker::new("worker-1", HashSet::from([JobType::Validation]));
        assert!(w.can_run(JobType::Validation));
        assert!(!w.can_run(JobType::Cleanup));
    }
}
