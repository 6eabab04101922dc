//! Workflow type: an ordered job list plus in-flight bookkeeping sets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::job::Job;

/// Status of a workflow as a whole. Moves monotonically:
/// pending -> running -> {completed, failed, cancelled}. No transitions back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A workflow: an ordered job list plus the three disjoint in-flight id-sets.
///
/// Invariant (P1): at any quiescent moment `current_jobs`, `completed_jobs`
/// and `failed_jobs` are pairwise disjoint and their union is a subset of the
/// workflow's job ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub current_jobs: HashSet<String>,
    #[serde(default)]
    pub completed_jobs: HashSet<String>,
    #[serde(default)]
    pub failed_jobs: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>, jobs: Vec<Job>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            status: WorkflowStatus::Pending,
            jobs,
            current_jobs: HashSet::new(),
            completed_jobs: HashSet::new(),
            failed_jobs: HashSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    pub fn job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;

    #[test]
    fn new_workflow_starts_pending_with_empty_sets() {
        let wf = Workflow::new("wf-1", "demo", vec![Job::new("a", JobType::Validation)]);
        assert_eq!(wf.status, WorkflowStatus::Pending);
        assert!(wf.current_jobs.is_empty());
        assert!(wf.completed_jobs.is_empty());
        assert!(wf.failed_jobs.is_empty());
    }

    #[test]
    fn job_lookup_finds_by_id() {
        let wf = Workflow::new("wf-1", "demo", vec![Job::new("a", JobType::Validation)]);
        assert!(wf.job("a").is_some());
        assert!(wf.job("missing").is_none());
    }
}
