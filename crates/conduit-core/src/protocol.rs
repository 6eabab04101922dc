//! Worker <-> coordinator wire protocol
//!
//! Each message is a structured record carrying a `type` discriminator.
//! Unknown message types are forward-compatible: the registry logs and
//! ignores anything that doesn't deserialize into [`WorkerMessage`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobType;

/// Messages sent worker -> coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Declares the job types this worker can execute.
    Register { capabilities: Vec<JobType> },

    /// Keep-alive; `worker_id` is redundant with the connection's identity
    /// but carried for parity with the wire schema.
    Heartbeat { worker_id: Option<String> },

    /// Reports the outcome of a previously assigned job.
    JobStatus {
        job_id: String,
        status: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        worker_id: Option<String>,
    },

    /// Signals the worker is idle and able to accept a new assignment.
    Ready { worker_id: Option<String> },
}

/// Messages sent coordinator -> worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    RegistrationAck {
        worker_id: String,
        status: &'static str,
        timestamp: DateTime<Utc>,
    },

    HeartbeatAck { timestamp: DateTime<Utc> },

    JobAssignment {
        job_id: String,
        job_type: JobType,
        parameters: Value,
        timestamp: DateTime<Utc>,
    },
}

impl CoordinatorMessage {
    pub fn registration_ack(worker_id: impl Into<String>) -> Self {
        Self::RegistrationAck {
            worker_id: worker_id.into(),
            status: "registered",
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat_ack() -> Self {
        Self::HeartbeatAck {
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_message_serializes_with_tag() {
        let msg = WorkerMessage::Register {
            capabilities: vec![JobType::Validation, JobType::Cleanup],
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains("\"type\":\"register\""));
        let decoded: WorkerMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn job_status_message_tolerates_missing_optional_fields() {
        let raw = json!({"type": "job_status", "job_id": "a", "status": "running"});
        let decoded: WorkerMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(
            decoded,
            WorkerMessage::JobStatus {
                job_id: "a".into(),
                status: "running".into(),
                result: None,
                worker_id: None,
            }
        );
    }

    #[test]
    fn unknown_message_type_fails_to_deserialize_into_worker_message() {
        let raw = json!({"type": "unknown_thing"});
        let decoded: Result<WorkerMessage, _> = serde_json::from_value(raw);
        assert!(decoded.is_err());
    }

    #[test]
    fn job_assignment_round_trips() {
        let msg = CoordinatorMessage::JobAssignment {
            job_id: "a".into(),
            job_type: JobType::Processing,
            parameters: json!({"k": "v"}),
            timestamp: Utc::now(),
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: CoordinatorMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }
}
