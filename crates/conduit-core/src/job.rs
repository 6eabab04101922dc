//! Job type: the unit of work inside a workflow graph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Closed set of job types a worker may declare capability for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Validation,
    Processing,
    Integration,
    Cleanup,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Processing => write!(f, "processing"),
            Self::Integration => write!(f, "integration"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(Self::Validation),
            "processing" => Ok(Self::Processing),
            "integration" => Ok(Self::Integration),
            "cleanup" => Ok(Self::Cleanup),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Status of a job within its workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
    Skipped,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// A single node in a workflow's job graph.
///
/// Only the engine mutates `status`/`retry_count`/`result`/`error`; only the
/// scheduler sets `worker_id` on assignment; the registry clears it on
/// worker failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub status: JobStatus,
    pub worker_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub on_success: Vec<String>,
    #[serde(default)]
    pub on_failure: Vec<String>,
    #[serde(default)]
    pub always_run: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_max_retries() -> u32 {
    3
}

impl Job {
    /// Construct a new job in `pending` status, as it appears at workflow definition time.
    pub fn new(id: impl Into<String>, job_type: JobType) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            job_type,
            parameters: HashMap::new(),
            status: JobStatus::Pending,
            worker_id: None,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            on_success: Vec::new(),
            on_failure: Vec::new(),
            always_run: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_round_trips_through_display_and_from_str() {
        for jt in [
            JobType::Validation,
            JobType::Processing,
            JobType::Integration,
            JobType::Cleanup,
        ] {
            let parsed: JobType = jt.to_string().parse().unwrap();
            assert_eq!(jt, parsed);
        }
    }

    #[test]
    fn new_job_defaults_match_spec() {
        let job = Job::new("validate-input", JobType::Validation);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.retry_count, 0);
        assert!(job.on_success.is_empty());
        assert!(!job.always_run);
    }
}
