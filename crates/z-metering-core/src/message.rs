//! Wire messages exchanged with the external worker.
//!
//! Both messages travel as JSON. The task message is published at
//! admission; the result message is consumed by settlement.

use serde::{Deserialize, Serialize};

use crate::error::{MeteringError, Result};
use crate::{Job, JobId, UserId};

/// Worker identity recorded when a result message does not name one.
pub const UNKNOWN_WORKER: &str = "unknown";

/// A task handed to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// The job to run.
    pub job_id: JobId,

    /// The paying user.
    pub user_id: UserId,

    /// Opaque worker input.
    pub input: serde_json::Value,
}

impl TaskMessage {
    /// Build the task message for a job.
    #[must_use]
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            user_id: job.user_id,
            input: job.input.clone(),
        }
    }

    /// Encode as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::Serialization` if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| MeteringError::Serialization(e.to_string()))
    }
}

/// A result reported by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    /// The job the result belongs to. Older workers call it `prediction_id`.
    #[serde(alias = "prediction_id")]
    pub job_id: JobId,

    /// Opaque result payload, inspected only by the classifier.
    #[serde(default)]
    pub result: serde_json::Value,

    /// The worker that produced the result.
    #[serde(default = "unknown_worker")]
    pub worker_id: String,
}

fn unknown_worker() -> String {
    UNKNOWN_WORKER.to_string()
}

impl ResultMessage {
    /// Decode from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::Serialization` if the body is not a valid
    /// result message.
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| MeteringError::Serialization(e.to_string()))
    }

    /// Encode as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::Serialization` if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| MeteringError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_message_schema() {
        let job = Job::new(UserId::generate(), 10, json!({"transaction": {"amount": 5}}));
        let value: serde_json::Value =
            serde_json::from_slice(&TaskMessage::for_job(&job).to_bytes().unwrap()).unwrap();

        assert_eq!(value["job_id"], job.id.to_string());
        assert_eq!(value["user_id"], job.user_id.to_string());
        assert_eq!(value["input"]["transaction"]["amount"], 5);
    }

    #[test]
    fn result_message_accepts_legacy_field_name() {
        let job_id = JobId::generate();
        let body = json!({"prediction_id": job_id.to_string(), "result": {"status": "failed"}});
        let msg = ResultMessage::from_bytes(body.to_string().as_bytes()).unwrap();

        assert_eq!(msg.job_id, job_id);
        assert_eq!(msg.worker_id, UNKNOWN_WORKER);
    }

    #[test]
    fn result_message_without_result_decodes_to_null() {
        let job_id = JobId::generate();
        let body = json!({"job_id": job_id.to_string(), "worker_id": "w-7"});
        let msg = ResultMessage::from_bytes(body.to_string().as_bytes()).unwrap();

        assert!(msg.result.is_null());
        assert_eq!(msg.worker_id, "w-7");
    }

    #[test]
    fn malformed_body_is_rejected() {
        assert!(ResultMessage::from_bytes(b"{not json").is_err());
        assert!(ResultMessage::from_bytes(br#"{"job_id": "nope"}"#).is_err());
    }
}
