//! Textual workflow definitions (spec.md §6's "create workflow from textual
//! definition", format resolved from the original `workflow_parser.py`):
//!
//! ```yaml
//! workflow:
//!   name: "data-processing-pipeline"
//!   jobs:
//!     - id: "validate-input"
//!       type: "validation"
//!       parameters:
//!         schema: "user-data"
//!       on_success: "process-data"
//!       on_failure: "send-error-notification"
//!     - id: "process-data"
//!       type: "processing"
//!       parameters:
//!         operation: "transform"
//!       always_run: true
//! ```
//!
//! `on_success`/`on_failure` accept either a bare string or a list of
//! strings and are normalized to `Vec<String>`. Graph soundness (dangling
//! references, cycles, duplicate ids) is *not* re-checked here — that's
//! `conduit_engine::engine::validate_definition`'s job; this module only
//! validates the document is well-formed enough to build a `Workflow`.

use std::collections::{HashMap, HashSet};

use conduit_core::{Job, JobType, Workflow, WorkflowStatus};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum YamlDefinitionError {
    #[error("invalid yaml: {0}")]
    Malformed(#[from] serde_yaml::Error),
    #[error("yaml must contain a 'workflow' key")]
    MissingWorkflowKey,
    #[error("workflow must have at least one job")]
    NoJobs,
    #[error("job at index {index} must have an 'id'")]
    MissingJobId { index: usize },
    #[error("job '{id}' has invalid type '{job_type}'")]
    InvalidJobType { id: String, job_type: String },
    #[error("duplicate job id: {0}")]
    DuplicateJobId(String),
    #[error("job '{job}' references non-existent job in {field}: '{reference}'")]
    DanglingReference {
        job: String,
        field: &'static str,
        reference: String,
    },
}

#[derive(Debug, Deserialize)]
struct Document {
    workflow: WorkflowDef,
}

#[derive(Debug, Deserialize)]
struct WorkflowDef {
    id: Option<String>,
    name: String,
    #[serde(default)]
    jobs: Vec<JobDef>,
}

#[derive(Debug, Deserialize)]
struct JobDef {
    id: String,
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    parameters: HashMap<String, Value>,
    #[serde(default)]
    on_success: Option<OneOrMany>,
    #[serde(default)]
    on_failure: Option<OneOrMany>,
    #[serde(default)]
    always_run: bool,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s],
            Self::Many(v) => v,
        }
    }
}

/// Parse a YAML workflow document into a `Workflow` with `Pending` jobs. The
/// workflow id is server-generated (UUID v7) if the document omits one.
pub fn parse_yaml_workflow(yaml_content: &str) -> Result<Workflow, YamlDefinitionError> {
    let doc: Document = serde_yaml::from_str(yaml_content)?;
    let workflow_def = doc.workflow;

    if workflow_def.jobs.is_empty() {
        return Err(YamlDefinitionError::NoJobs);
    }

    let mut jobs = Vec::with_capacity(workflow_def.jobs.len());
    let mut job_ids = HashSet::new();

    for (index, job_def) in workflow_def.jobs.into_iter().enumerate() {
        if job_def.id.is_empty() {
            return Err(YamlDefinitionError::MissingJobId { index });
        }
        if !job_ids.insert(job_def.id.clone()) {
            return Err(YamlDefinitionError::DuplicateJobId(job_def.id));
        }
        jobs.push(parse_job(job_def)?);
    }

    validate_references(&jobs, &job_ids)?;

    let id = workflow_def
        .id
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

    Ok(Workflow {
        id,
        name: workflow_def.name,
        status: WorkflowStatus::Pending,
        jobs,
        current_jobs: HashSet::new(),
        completed_jobs: HashSet::new(),
        failed_jobs: HashSet::new(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    })
}

fn parse_job(job_def: JobDef) -> Result<Job, YamlDefinitionError> {
    let job_type: JobType = job_def.job_type.parse().map_err(|_| YamlDefinitionError::InvalidJobType {
        id: job_def.id.clone(),
        job_type: job_def.job_type.clone(),
    })?;

    let mut job = Job::new(job_def.id, job_type);
    job.parameters = job_def.parameters;
    job.on_success = job_def.on_success.map(OneOrMany::into_vec).unwrap_or_default();
    job.on_failure = job_def.on_failure.map(OneOrMany::into_vec).unwrap_or_default();
    job.always_run = job_def.always_run;
    job.max_retries = job_def.max_retries;
    Ok(job)
}

fn validate_references(jobs: &[Job], job_ids: &HashSet<String>) -> Result<(), YamlDefinitionError> {
    for job in jobs {
        for reference in &job.on_success {
            if !job_ids.contains(reference) {
                return Err(YamlDefinitionError::DanglingReference {
                    job: job.id.clone(),
                    field: "on_success",
                    reference: reference.clone(),
                });
            }
        }
        for reference in &job.on_failure {
            if !job_ids.contains(reference) {
                return Err(YamlDefinitionError::DanglingReference {
                    job: job.id.clone(),
                    field: "on_failure",
                    reference: reference.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Render a workflow back to the textual format, the inverse of
/// [`parse_yaml_workflow`] (minus `parameters`' key ordering, which YAML
/// doesn't guarantee either way).
pub fn workflow_to_yaml(workflow: &Workflow) -> Result<String, serde_yaml::Error> {
    #[derive(serde::Serialize)]
    struct OutDoc {
        workflow: OutWorkflow,
    }
    #[derive(serde::Serialize)]
    struct OutWorkflow {
        id: String,
        name: String,
        jobs: Vec<OutJob>,
    }
    #[derive(serde::Serialize)]
    struct OutJob {
        id: String,
        #[serde(rename = "type")]
        job_type: JobType,
        parameters: HashMap<String, Value>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        on_success: Vec<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        on_failure: Vec<String>,
        #[serde(skip_serializing_if = "is_false")]
        always_run: bool,
        #[serde(skip_serializing_if = "is_default_max_retries")]
        max_retries: u32,
    }
    fn is_false(v: &bool) -> bool {
        !*v
    }
    fn is_default_max_retries(v: &u32) -> bool {
        *v == 3
    }

    let doc = OutDoc {
        workflow: OutWorkflow {
            id: workflow.id.clone(),
            name: workflow.name.clone(),
            jobs: workflow
                .jobs
                .iter()
                .map(|job| OutJob {
                    id: job.id.clone(),
                    job_type: job.job_type,
                    parameters: job.parameters.clone(),
                    on_success: job.on_success.clone(),
                    on_failure: job.on_failure.clone(),
                    always_run: job.always_run,
                    max_retries: job.max_retries,
                })
                .collect(),
        },
    };
    serde_yaml::to_string(&doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR_YAML: &str = r#"
workflow:
  name: "data-processing-pipeline"
  jobs:
    - id: "validate-input"
      type: "validation"
      parameters:
        schema: "user-data"
      on_success: "process-data"
      on_failure: "send-error-notification"
    - id: "process-data"
      type: "processing"
      parameters:
        operation: "transform"
    - id: "send-error-notification"
      type: "cleanup"
      always_run: true
"#;

    #[test]
    fn parses_linear_pipeline_and_normalizes_bare_string_successors() {
        let workflow = parse_yaml_workflow(LINEAR_YAML).unwrap();
        assert_eq!(workflow.name, "data-processing-pipeline");
        assert_eq!(workflow.jobs.len(), 3);
        let validate = workflow.job("validate-input").unwrap();
        assert_eq!(validate.on_success, vec!["process-data".to_string()]);
        assert_eq!(validate.on_failure, vec!["send-error-notification".to_string()]);
        assert_eq!(validate.max_retries, 3);
    }

    #[test]
    fn parses_list_form_of_on_success() {
        let yaml = r#"
workflow:
  name: "fan-out"
  jobs:
    - id: "a"
      type: "validation"
      on_success: ["b", "c"]
    - id: "b"
      type: "processing"
    - id: "c"
      type: "processing"
"#;
        let workflow = parse_yaml_workflow(yaml).unwrap();
        assert_eq!(workflow.job("a").unwrap().on_success, vec!["b", "c"]);
    }

    #[test]
    fn rejects_missing_workflow_key() {
        let err = parse_yaml_workflow("jobs: []").unwrap_err();
        assert!(matches!(err, YamlDefinitionError::Malformed(_)));
    }

    #[test]
    fn rejects_empty_job_list() {
        let err = parse_yaml_workflow("workflow:\n  name: empty\n  jobs: []").unwrap_err();
        assert!(matches!(err, YamlDefinitionError::NoJobs));
    }

    #[test]
    fn rejects_duplicate_job_ids() {
        let yaml = r#"
workflow:
  name: "dup"
  jobs:
    - id: "a"
      type: "validation"
    - id: "a"
      type: "processing"
"#;
        let err = parse_yaml_workflow(yaml).unwrap_err();
        assert!(matches!(err, YamlDefinitionError::DuplicateJobId(id) if id == "a"));
    }

    #[test]
    fn rejects_dangling_reference() {
        let yaml = r#"
workflow:
  name: "dangling"
  jobs:
    - id: "a"
      type: "validation"
      on_success: "missing"
"#;
        let err = parse_yaml_workflow(yaml).unwrap_err();
        assert!(matches!(err, YamlDefinitionError::DanglingReference { .. }));
    }

    #[test]
    fn rejects_unknown_job_type() {
        let yaml = r#"
workflow:
  name: "bad-type"
  jobs:
    - id: "a"
      type: "not-a-real-type"
"#;
        let err = parse_yaml_workflow(yaml).unwrap_err();
        assert!(matches!(err, YamlDefinitionError::InvalidJobType { .. }));
    }

    #[test]
    fn round_trips_through_yaml_and_back() {
        let workflow = parse_yaml_workflow(LINEAR_YAML).unwrap();
        let rendered = workflow_to_yaml(&workflow).unwrap();
        let reparsed = parse_yaml_workflow(&rendered).unwrap();
        assert_eq!(reparsed.name, workflow.name);
        assert_eq!(reparsed.jobs.len(), workflow.jobs.len());
    }
}
