//! Reconciliation of jobs whose result never arrived.
//!
//! A worker that dies before publishing leaves its job pending with the
//! cost reserved. The [`Reconciler`] fails such jobs once they pass a
//! configured deadline, refunding them through the settlement path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;
use crate::ledger::Ledger;
use crate::settlement::{SettlementEngine, SettlementOutcome};
use crate::supervisor::{Heartbeat, SupervisedTask};

/// Pending jobs examined per sweep.
const SWEEP_BATCH: usize = 500;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending jobs looked at.
    pub examined: usize,
    /// Jobs failed and refunded for missing their deadline.
    pub expired: usize,
    /// Jobs that could not be settled this time.
    pub errors: usize,
}

/// Periodically expires overdue pending jobs.
pub struct Reconciler {
    ledger: Ledger,
    settlement: Arc<SettlementEngine>,
    deadline: Duration,
    interval: Duration,
}

impl Reconciler {
    /// Create a reconciler expiring jobs older than `deadline`, sweeping
    /// every `interval`.
    #[must_use]
    pub fn new(
        ledger: Ledger,
        settlement: Arc<SettlementEngine>,
        deadline: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            settlement,
            deadline,
            interval,
        }
    }

    /// Expire every pending job created before `now - deadline`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pending jobs cannot be listed. Failures to
    /// settle individual jobs are counted and retried on the next sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, ServiceError> {
        let Some(cutoff) = chrono::Duration::from_std(self.deadline)
            .ok()
            .and_then(|deadline| now.checked_sub_signed(deadline))
        else {
            return Ok(SweepReport::default());
        };
        let pending = self.ledger.store().list_pending_jobs(SWEEP_BATCH)?;

        let mut report = SweepReport::default();
        for job in pending {
            report.examined += 1;
            if job.created_at > cutoff {
                continue;
            }

            let job_id = job.id;
            match self.settlement.expire(job) {
                Ok(SettlementOutcome::Settled { .. }) => {
                    report.expired += 1;
                    tracing::warn!(job_id = %job_id, "Pending job expired and refunded");
                }
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(job_id = %job_id, error = %e, "Could not expire pending job");
                }
            }
        }

        if report.expired > 0 || report.errors > 0 {
            tracing::info!(
                examined = report.examined,
                expired = report.expired,
                errors = report.errors,
                "Reconciliation sweep finished"
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl SupervisedTask for Reconciler {
    fn name(&self) -> &str {
        "reconciler"
    }

    async fn run(&self, heartbeat: Arc<Heartbeat>, cancel: CancellationToken) -> Result<(), ServiceError> {
        tracing::info!(deadline = ?self.deadline, "Reconciler running");
        loop {
            heartbeat.beat();
            self.sweep(Utc::now())?;
            heartbeat.beat();

            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
