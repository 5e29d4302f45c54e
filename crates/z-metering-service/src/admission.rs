//! Job admission.
//!
//! Admitting a job reserves its cost and records it as pending in one
//! write, then publishes the task. If the publish fails the job is failed
//! and refunded before the caller sees the error.

use std::sync::Arc;

use serde_json::Value;

use z_metering_core::{FailureReason, Job, Outcome, TaskMessage, UserId};
use z_metering_queue::MessageQueue;

use crate::error::{AdmissionError, LedgerError, SettlementError};
use crate::ledger::Ledger;
use crate::settlement::SettlementEngine;

/// Identity recorded on jobs settled by admission itself.
const ADMISSION_SETTLER: &str = "admission";

/// Admits jobs: validate, reserve, dispatch.
pub struct AdmissionController {
    ledger: Ledger,
    settlement: Arc<SettlementEngine>,
    queue: Arc<dyn MessageQueue>,
    task_topic: String,
    required_fields: Vec<String>,
}

impl AdmissionController {
    /// Create a controller publishing to `task_topic`.
    ///
    /// `required_fields` are the top-level input keys the worker needs.
    #[must_use]
    pub fn new(
        ledger: Ledger,
        settlement: Arc<SettlementEngine>,
        queue: Arc<dyn MessageQueue>,
        task_topic: impl Into<String>,
        required_fields: Vec<String>,
    ) -> Self {
        Self {
            ledger,
            settlement,
            queue,
            task_topic: task_topic.into(),
            required_fields,
        }
    }

    /// Admit a job for `user_id`.
    ///
    /// On success the returned job is `Pending`; its result is settled
    /// later, out of band.
    ///
    /// # Errors
    ///
    /// - `AdmissionError::InvalidAmount` if `cost <= 0`.
    /// - `AdmissionError::InvalidInput` if required input fields are missing.
    /// - `AdmissionError::PaymentRequired` if the balance does not cover `cost`.
    /// - `AdmissionError::Dispatch` if the task could not be published.
    pub async fn admit(&self, user_id: UserId, input: Value, cost: i64) -> Result<Job, AdmissionError> {
        if cost <= 0 {
            return Err(AdmissionError::InvalidAmount(cost));
        }
        self.validate_input(&input)?;

        let job = Job::new(user_id, cost, input);
        self.ledger.open_job(&job).map_err(|e| match e {
            LedgerError::InsufficientFunds { balance, required } => {
                tracing::info!(
                    user_id = %user_id,
                    balance = balance,
                    required = required,
                    "Admission refused, insufficient funds"
                );
                AdmissionError::PaymentRequired { balance, required }
            }
            LedgerError::InvalidAmount(amount) => AdmissionError::InvalidAmount(amount),
            other => AdmissionError::Storage(other),
        })?;

        if let Err(reason) = self.dispatch(&job).await {
            tracing::error!(
                job_id = %job.id,
                user_id = %user_id,
                error = %reason,
                "Task publish failed, compensating reservation"
            );
            self.compensate(job.clone())?;
            return Err(AdmissionError::Dispatch {
                job_id: job.id.to_string(),
                reason,
            });
        }

        tracing::info!(job_id = %job.id, user_id = %user_id, topic = %self.task_topic, "Job dispatched");
        Ok(job)
    }

    fn validate_input(&self, input: &Value) -> Result<(), AdmissionError> {
        let Some(object) = input.as_object() else {
            return Err(AdmissionError::InvalidInput("input must be an object".into()));
        };

        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .filter(|field| !object.contains_key(field.as_str()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AdmissionError::InvalidInput(format!(
                "missing required fields: {}",
                missing.join(", ")
            )))
        }
    }

    async fn dispatch(&self, job: &Job) -> Result<(), String> {
        let body = TaskMessage::for_job(job)
            .to_bytes()
            .map_err(|e| e.to_string())?;
        self.queue
            .publish(&self.task_topic, &body)
            .await
            .map_err(|e| e.to_string())
    }

    /// Settle a job whose task was never published, refunding its cost with
    /// the reason "publish failed".
    fn compensate(&self, job: Job) -> Result<(), AdmissionError> {
        self.settlement
            .finalize(
                job,
                &Outcome::Failure(FailureReason::PublishFailed),
                None,
                ADMISSION_SETTLER,
            )
            .map(|_| ())
            .map_err(|e| {
                tracing::error!(error = %e, "Compensation after failed dispatch did not complete");
                match e {
                    SettlementError::Ledger(inner)
                    | SettlementError::RefundFailed { source: inner, .. } => {
                        AdmissionError::Storage(inner)
                    }
                }
            })
    }
}
