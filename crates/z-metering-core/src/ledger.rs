//! Ledger transaction types for z-metering.
//!
//! Every balance change is recorded as an immutable [`Transaction`]. A
//! transaction is only written once its effect on the balance is final, so
//! there is no pending state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, TransactionId, UserId};

/// An immutable ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub id: TransactionId,

    /// The user whose balance was affected.
    pub user_id: UserId,

    /// Signed amount in minor units. Positive = credit, negative = debit.
    pub amount: i64,

    /// What caused the entry.
    pub kind: TransactionKind,

    /// Whether the entry took effect.
    pub status: TransactionStatus,

    /// The job that caused a reservation or refund.
    pub related_job_id: Option<JobId>,

    /// Human-readable description.
    pub description: String,

    /// Balance after this transaction. Filled in by the store at commit time.
    pub balance_after: i64,

    /// Additional context.
    pub metadata: serde_json::Value,

    /// When the transaction was created.
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    fn new(
        user_id: UserId,
        amount: i64,
        kind: TransactionKind,
        related_job_id: Option<JobId>,
        description: String,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            user_id,
            amount,
            kind,
            status: TransactionStatus::Completed,
            related_job_id,
            description,
            balance_after: 0,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    /// A deposit of `amount` credits.
    #[must_use]
    pub fn deposit(user_id: UserId, amount: i64, description: String) -> Self {
        Self::new(user_id, amount.abs(), TransactionKind::Deposit, None, description)
    }

    /// A reservation (debit) of `amount` credits for a job.
    #[must_use]
    pub fn reservation(user_id: UserId, amount: i64, job_id: JobId, description: String) -> Self {
        Self::new(
            user_id,
            -amount.abs(),
            TransactionKind::Reservation,
            Some(job_id),
            description,
        )
    }

    /// A compensating credit of `amount` for a job.
    #[must_use]
    pub fn refund(user_id: UserId, amount: i64, job_id: JobId, description: String) -> Self {
        Self::new(
            user_id,
            amount.abs(),
            TransactionKind::Refund,
            Some(job_id),
            description,
        )
    }

    /// A zero-amount marker recording that a refund could not be applied.
    ///
    /// The intended amount is kept in `metadata` so the balance invariant is
    /// unaffected.
    #[must_use]
    pub fn adjustment_failed(
        user_id: UserId,
        intended_amount: i64,
        job_id: JobId,
        description: String,
    ) -> Self {
        let mut tx = Self::new(
            user_id,
            0,
            TransactionKind::AdjustmentFailed,
            Some(job_id),
            description,
        );
        tx.status = TransactionStatus::Failed;
        tx.metadata = serde_json::json!({ "intended_amount": intended_amount });
        tx
    }

    /// Whether this is the completed refund for `job_id`.
    #[must_use]
    pub fn is_refund_for(&self, job_id: JobId) -> bool {
        self.kind == TransactionKind::Refund
            && self.status == TransactionStatus::Completed
            && self.related_job_id == Some(job_id)
    }
}

/// Type of ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Credits added to the account.
    Deposit,

    /// Credits debited when a job is admitted.
    Reservation,

    /// Credits returned because a job did not succeed.
    Refund,

    /// A refund that could not be applied.
    AdjustmentFailed,
}

impl TransactionKind {
    /// Get the kind name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Reservation => "reservation",
            Self::Refund => "refund",
            Self::AdjustmentFailed => "adjustment_failed",
        }
    }
}

/// Status of a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// The entry's amount is reflected in the balance.
    Completed,

    /// The entry records an attempt that had no effect.
    Failed,
}

/// The effect of a committed ledger transaction on an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    /// Balance before the transaction.
    pub previous: i64,

    /// Balance after the transaction.
    pub current: i64,

    /// The transaction that was written.
    pub transaction_id: TransactionId,
}
