//! The credit ledger.
//!
//! Every balance change in the service goes through [`Ledger`]. The store
//! makes each call atomic for one user; the ledger validates amounts,
//! builds the transaction records and translates storage errors.

use std::sync::Arc;

use serde::Serialize;

use z_metering_core::{BalanceChange, Job, JobId, Transaction, UserId};
use z_metering_store::Store;

use crate::error::LedgerError;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Comparison of a stored balance against its transaction history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    /// The audited user.
    pub user_id: UserId,
    /// Balance stored on the account.
    pub balance: i64,
    /// Sum of all of the user's transaction amounts.
    pub ledger_sum: i64,
}

impl AuditReport {
    /// Whether the balance equals the transaction sum.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.balance == self.ledger_sum
    }
}

/// Per-user balances and their append-only transaction log.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn Store>,
}

fn positive(amount: i64) -> Result<i64> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(amount)
}

impl Ledger {
    /// Create a ledger over a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Current balance, creating an empty account on first use.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` on storage failure.
    pub fn balance(&self, user_id: &UserId) -> Result<i64> {
        Ok(self.store.ensure_account(user_id)?.balance)
    }

    /// Credit `amount` to a user.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidAmount` if `amount <= 0`.
    pub fn deposit(&self, user_id: UserId, amount: i64, description: &str) -> Result<BalanceChange> {
        let amount = positive(amount)?;
        let change = self
            .store
            .commit_transaction(Transaction::deposit(user_id, amount, description.to_string()))?;

        tracing::info!(
            user_id = %user_id,
            amount = amount,
            balance = change.current,
            "Deposit applied"
        );
        Ok(change)
    }

    /// Debit `amount` from a user on behalf of a job.
    ///
    /// # Errors
    ///
    /// - `LedgerError::InvalidAmount` if `amount <= 0`.
    /// - `LedgerError::InsufficientFunds` if the balance is below `amount`.
    pub fn reserve(
        &self,
        user_id: UserId,
        amount: i64,
        job_id: JobId,
        description: &str,
    ) -> Result<BalanceChange> {
        let amount = positive(amount)?;
        let change = self.store.commit_transaction(Transaction::reservation(
            user_id,
            amount,
            job_id,
            description.to_string(),
        ))?;

        tracing::info!(
            user_id = %user_id,
            job_id = %job_id,
            amount = amount,
            balance = change.current,
            "Credits reserved"
        );
        Ok(change)
    }

    /// Credit `amount` back to a user for a job.
    ///
    /// The store rejects a second completed refund for the same job, so a
    /// repeated call fails with `DuplicateRefund` instead of paying twice.
    ///
    /// # Errors
    ///
    /// - `LedgerError::InvalidAmount` if `amount <= 0`.
    /// - `LedgerError::DuplicateRefund` if the job was already refunded.
    pub fn refund(
        &self,
        user_id: UserId,
        amount: i64,
        job_id: JobId,
        description: &str,
    ) -> Result<BalanceChange> {
        let amount = positive(amount)?;
        let change = self.store.commit_transaction(Transaction::refund(
            user_id,
            amount,
            job_id,
            description.to_string(),
        ))?;

        tracing::info!(
            user_id = %user_id,
            job_id = %job_id,
            amount = amount,
            balance = change.current,
            "Refund applied"
        );
        Ok(change)
    }

    /// Whether a completed refund exists for the job.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` on storage failure.
    pub fn has_refund(&self, job_id: &JobId) -> Result<bool> {
        Ok(self.store.find_refund(job_id)?.is_some())
    }

    /// Record that a job's refund could not be applied. Moves no credits.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` on storage failure.
    pub fn record_adjustment_failure(
        &self,
        user_id: UserId,
        intended_amount: i64,
        job_id: JobId,
        description: &str,
    ) -> Result<()> {
        self.store.commit_transaction(Transaction::adjustment_failed(
            user_id,
            intended_amount,
            job_id,
            description.to_string(),
        ))?;
        Ok(())
    }

    /// Reserve a job's cost and record the pending job in one write.
    ///
    /// # Errors
    ///
    /// - `LedgerError::InvalidAmount` if the cost is not positive.
    /// - `LedgerError::InsufficientFunds` if the balance does not cover it.
    pub fn open_job(&self, job: &Job) -> Result<BalanceChange> {
        let cost = positive(job.cost)?;
        let reservation = Transaction::reservation(
            job.user_id,
            cost,
            job.id,
            format!("reservation for job {}", job.id),
        );
        let change = self.store.open_job(job, reservation)?;

        tracing::info!(
            user_id = %job.user_id,
            job_id = %job.id,
            cost = cost,
            balance = change.current,
            "Job admitted, credits reserved"
        );
        Ok(change)
    }

    /// Write a settled job, refunding its cost in the same write when
    /// `refund_reason` is given.
    ///
    /// # Errors
    ///
    /// - `LedgerError::AlreadySettled` if the stored job is no longer pending.
    /// - `LedgerError::DuplicateRefund` if the job was already refunded.
    pub fn settle_job(&self, job: &Job, refund_reason: Option<&str>) -> Result<Option<BalanceChange>> {
        let refund = match refund_reason {
            Some(reason) => Some(Transaction::refund(
                job.user_id,
                positive(job.cost)?,
                job.id,
                reason.to_string(),
            )),
            None => None,
        };
        Ok(self.store.settle_job(job, refund)?)
    }

    /// Load a job.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` on storage failure.
    pub fn job(&self, job_id: &JobId) -> Result<Option<Job>> {
        Ok(self.store.get_job(job_id)?)
    }

    /// A user's transactions, newest first.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` on storage failure.
    pub fn transactions(&self, user_id: &UserId, limit: usize, offset: usize) -> Result<Vec<Transaction>> {
        Ok(self.store.list_transactions_by_user(user_id, limit, offset)?)
    }

    /// Recompute a user's transaction sum and compare it with the balance.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` on storage failure.
    pub fn audit(&self, user_id: &UserId) -> Result<AuditReport> {
        let balance = self
            .store
            .get_account(user_id)?
            .map_or(0, |account| account.balance);
        let ledger_sum = self.store.sum_transactions(user_id)?;

        let report = AuditReport {
            user_id: *user_id,
            balance,
            ledger_sum,
        };
        if !report.is_consistent() {
            tracing::error!(
                user_id = %user_id,
                balance = balance,
                ledger_sum = ledger_sum,
                "Ledger audit mismatch"
            );
        }
        Ok(report)
    }
}
