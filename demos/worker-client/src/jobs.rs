//! Trivial stand-in job execution. Worker-side job *implementations*
//! (`worker/jobs/*.py`: real validation/processing/integration/cleanup
//! logic) are explicitly out of scope (spec.md, SPEC_FULL.md §12) — this
//! sleeps briefly and echoes its parameters back, enough to drive the wire
//! protocol through a full assign -> complete cycle.

use std::time::Duration;

use conduit_core::JobType;
use serde_json::Value;

pub async fn execute(job_type: JobType, parameters: &Value) -> Value {
    tokio::time::sleep(Duration::from_millis(200)).await;
    serde_json::json!({
        "job_type": job_type.to_string(),
        "echo": parameters,
    })
}
