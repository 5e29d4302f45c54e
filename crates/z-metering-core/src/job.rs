//! Compute job records.
//!
//! A job is created `Pending` at admission, together with the reservation
//! that pays for it, and moves to `Completed` or `Failed` exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::Outcome;
use crate::error::MeteringError;
use crate::{JobId, UserId};

/// A submitted compute request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID, assigned at admission.
    pub id: JobId,

    /// The user who pays for the job.
    pub user_id: UserId,

    /// Credits reserved at admission (minor units, always positive).
    pub cost: i64,

    /// Lifecycle status.
    pub status: JobStatus,

    /// Opaque worker input.
    pub input: serde_json::Value,

    /// Opaque worker result, once settled.
    pub result: Option<serde_json::Value>,

    /// Why the job failed, if it did.
    pub failure_reason: Option<String>,

    /// When the job was admitted.
    pub created_at: DateTime<Utc>,

    /// When the job reached a terminal status.
    pub settled_at: Option<DateTime<Utc>>,

    /// Identity of the worker or component that settled the job.
    pub settled_by: Option<String>,
}

impl Job {
    /// Create a new pending job.
    #[must_use]
    pub fn new(user_id: UserId, cost: i64, input: serde_json::Value) -> Self {
        Self {
            id: JobId::generate(),
            user_id,
            cost,
            status: JobStatus::Pending,
            input,
            result: None,
            failure_reason: None,
            created_at: Utc::now(),
            settled_at: None,
            settled_by: None,
        }
    }

    /// Whether the job has already been settled.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move the job to its terminal status according to `outcome`.
    ///
    /// # Errors
    ///
    /// Returns `MeteringError::AlreadySettled` if the job is not pending.
    pub fn settle(
        &mut self,
        outcome: &Outcome,
        result: Option<serde_json::Value>,
        settled_by: &str,
    ) -> Result<(), MeteringError> {
        if self.is_terminal() {
            return Err(MeteringError::AlreadySettled {
                job_id: self.id.to_string(),
                status: self.status,
            });
        }

        match outcome {
            Outcome::Success => {
                self.status = JobStatus::Completed;
                self.failure_reason = None;
            }
            Outcome::Failure(reason) => {
                self.status = JobStatus::Failed;
                self.failure_reason = Some(reason.to_string());
            }
        }
        self.result = result;
        self.settled_at = Some(Utc::now());
        self.settled_by = Some(settled_by.to_string());
        Ok(())
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted and dispatched, waiting for a result.
    Pending,

    /// Settled with a successful result. The reservation stands.
    Completed,

    /// Settled as failed. The reservation is refunded.
    Failed,
}

impl JobStatus {
    /// Whether the status is final.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::FailureReason;

    fn pending_job() -> Job {
        Job::new(
            UserId::generate(),
            10,
            serde_json::json!({ "transaction": {} }),
        )
    }

    #[test]
    fn new_job_is_pending() {
        let job = pending_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.is_terminal());
        assert!(job.settled_at.is_none());
    }

    #[test]
    fn settle_success_marks_completed() {
        let mut job = pending_job();
        job.settle(&Outcome::Success, Some(serde_json::json!({"ok": true})), "worker-1")
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.settled_by.as_deref(), Some("worker-1"));
        assert!(job.settled_at.is_some());
        assert!(job.failure_reason.is_none());
    }

    #[test]
    fn settle_failure_records_reason() {
        let mut job = pending_job();
        job.settle(&Outcome::Failure(FailureReason::EmptyResult), None, "worker-1")
            .unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some("empty/incomplete result"));
    }

    #[test]
    fn second_settle_is_rejected() {
        let mut job = pending_job();
        job.settle(&Outcome::Success, None, "w").unwrap();

        let err = job
            .settle(&Outcome::Failure(FailureReason::ExplicitStatus), None, "w")
            .unwrap_err();
        assert!(matches!(err, MeteringError::AlreadySettled { .. }));
        assert_eq!(job.status, JobStatus::Completed);
    }
}
