//! Settlement of job results.
//!
//! A result is settled at most once per job: the terminal transition is a
//! compare-and-set in the store, and the refund is anchored on the job ID,
//! so redelivered or duplicated results never move credits twice.

use serde_json::Value;

use z_metering_core::{ClassifierRules, FailureReason, Job, JobId, JobStatus, Outcome};

use crate::error::{LedgerError, SettlementError};
use crate::ledger::Ledger;

/// Result type for settlement.
pub type Result<T> = std::result::Result<T, SettlementError>;

/// What settling a result did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// The job moved to a terminal status.
    Settled {
        /// The job.
        job_id: JobId,
        /// Its new status.
        status: JobStatus,
        /// Whether its cost was refunded by this settlement.
        refunded: bool,
    },

    /// The job was already terminal; nothing changed.
    AlreadySettled {
        /// The job.
        job_id: JobId,
        /// Its stored status.
        status: String,
    },

    /// No such job; the result was dropped.
    UnknownJob {
        /// The job ID named by the result.
        job_id: JobId,
    },
}

/// Classifies results and applies terminal job transitions and refunds.
pub struct SettlementEngine {
    ledger: Ledger,
    rules: ClassifierRules,
}

impl SettlementEngine {
    /// Create an engine with the given worker contract.
    #[must_use]
    pub fn new(ledger: Ledger, rules: ClassifierRules) -> Self {
        Self { ledger, rules }
    }

    /// Settle a worker result for `job_id`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the job could not be settled and the
    /// result should be redelivered.
    pub fn settle(&self, job_id: JobId, raw_result: Value, worker_id: &str) -> Result<SettlementOutcome> {
        let Some(job) = self.ledger.job(&job_id)? else {
            tracing::warn!(job_id = %job_id, worker_id = %worker_id, "Result for unknown job dropped");
            return Ok(SettlementOutcome::UnknownJob { job_id });
        };

        if job.is_terminal() {
            tracing::warn!(
                job_id = %job_id,
                status = job.status.as_str(),
                worker_id = %worker_id,
                "Duplicate result for settled job ignored"
            );
            return Ok(SettlementOutcome::AlreadySettled {
                job_id,
                status: job.status.as_str().to_string(),
            });
        }

        let outcome = self.rules.classify(&raw_result);
        tracing::debug!(job_id = %job_id, outcome = ?outcome, "Result classified");

        self.finalize(job, &outcome, Some(raw_result), worker_id)
    }

    /// Move a pending job to the terminal status for `outcome`, refunding
    /// its cost on failure.
    ///
    /// The refund is written with the job update when possible. If that
    /// write fails transiently the refund is retried on its own, then the
    /// job is closed; if the refund cannot be applied at all an
    /// `AdjustmentFailed` entry records the gap.
    ///
    /// # Errors
    ///
    /// - `SettlementError::RefundFailed` if no refund path succeeded.
    /// - `SettlementError::Ledger` for other storage failures.
    pub fn finalize(
        &self,
        mut job: Job,
        outcome: &Outcome,
        result: Option<Value>,
        settled_by: &str,
    ) -> Result<SettlementOutcome> {
        if job.settle(outcome, result, settled_by).is_err() {
            return Ok(SettlementOutcome::AlreadySettled {
                job_id: job.id,
                status: job.status.as_str().to_string(),
            });
        }

        let reason = outcome
            .requires_refund()
            .then(|| job.failure_reason.clone())
            .flatten();

        let refund_reason = match &reason {
            Some(reason) if !self.ledger.has_refund(&job.id)? => Some(reason.as_str()),
            Some(_) => {
                tracing::warn!(job_id = %job.id, "Refund already recorded, closing job without one");
                None
            }
            None => None,
        };

        match self.ledger.settle_job(&job, refund_reason) {
            Ok(change) => {
                tracing::info!(
                    job_id = %job.id,
                    user_id = %job.user_id,
                    status = job.status.as_str(),
                    settled_by = %settled_by,
                    refunded = change.is_some(),
                    "Job settled"
                );
                Ok(Self::settled(&job, change.is_some()))
            }
            Err(LedgerError::AlreadySettled { status, .. }) => {
                tracing::warn!(job_id = %job.id, status = status, "Job settled concurrently");
                Ok(SettlementOutcome::AlreadySettled {
                    job_id: job.id,
                    status: status.to_string(),
                })
            }
            Err(LedgerError::DuplicateRefund { .. }) => {
                tracing::warn!(job_id = %job.id, "Refund raced in, closing job without one");
                self.close(&job, false)
            }
            Err(e) if e.is_transient() => match refund_reason {
                Some(reason) => self.fallback(&job, reason, &e),
                None => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Settle a job whose result never arrived.
    ///
    /// # Errors
    ///
    /// See [`Self::finalize`].
    pub fn expire(&self, job: Job) -> Result<SettlementOutcome> {
        self.finalize(
            job,
            &Outcome::Failure(FailureReason::DeadlineExceeded),
            None,
            "reconciler",
        )
    }

    /// Standalone refund followed by a refund-free job close.
    fn fallback(&self, job: &Job, reason: &str, primary: &LedgerError) -> Result<SettlementOutcome> {
        tracing::warn!(
            job_id = %job.id,
            error = %primary,
            "Settlement write failed, retrying refund on its own"
        );

        match self.ledger.refund(job.user_id, job.cost, job.id, reason) {
            Ok(_) | Err(LedgerError::DuplicateRefund { .. }) => {}
            Err(e) => {
                tracing::error!(
                    job_id = %job.id,
                    user_id = %job.user_id,
                    amount = job.cost,
                    error = %e,
                    "Refund failed on every path"
                );
                if let Err(record_err) = self.ledger.record_adjustment_failure(
                    job.user_id,
                    job.cost,
                    job.id,
                    &format!("refund failed: {e}"),
                ) {
                    tracing::error!(job_id = %job.id, error = %record_err, "Could not record failed adjustment");
                }
                return Err(SettlementError::RefundFailed {
                    job_id: job.id.to_string(),
                    source: e,
                });
            }
        }

        self.close(job, true)
    }

    fn close(&self, job: &Job, refunded: bool) -> Result<SettlementOutcome> {
        match self.ledger.settle_job(job, None) {
            Ok(_) => {
                tracing::info!(
                    job_id = %job.id,
                    status = job.status.as_str(),
                    refunded = refunded,
                    "Job settled"
                );
                Ok(Self::settled(job, refunded))
            }
            Err(LedgerError::AlreadySettled { status, .. }) => Ok(SettlementOutcome::AlreadySettled {
                job_id: job.id,
                status: status.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    const fn settled(job: &Job, refunded: bool) -> SettlementOutcome {
        SettlementOutcome::Settled {
            job_id: job.id,
            status: job.status,
            refunded,
        }
    }
}
