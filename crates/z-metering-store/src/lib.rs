//! `RocksDB` storage layer for z-metering.
//!
//! This crate persists accounts, ledger transactions and jobs using
//! `RocksDB` column families (see [`schema`]). Every write that touches an
//! account balance goes through a single `WriteBatch` taken under the user's
//! lock stripe, so a balance and the transactions that explain it can never
//! diverge.
//!
//! # Example
//!
//! ```no_run
//! use z_metering_store::{RocksStore, Store};
//! use z_metering_core::{Transaction, UserId};
//!
//! let store = RocksStore::open("/tmp/z-metering-db").unwrap();
//!
//! let user_id = UserId::generate();
//! let change = store
//!     .commit_transaction(Transaction::deposit(user_id, 100, "welcome".into()))
//!     .unwrap();
//! assert_eq!(change.current, 100);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod locks;
pub mod rocks;
pub mod schema;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;

use z_metering_core::{
    Account, BalanceChange, Job, JobId, Transaction, TransactionId, UserId,
};

/// The storage trait defining all database operations.
///
/// Implementations must make every balance-changing call atomic with the
/// transaction record it writes, and serialize such calls per user.
pub trait Store: Send + Sync {
    // =========================================================================
    // Accounts
    // =========================================================================

    /// Get an account by user ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_account(&self, user_id: &UserId) -> Result<Option<Account>>;

    /// Get an account, creating it with zero balance if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn ensure_account(&self, user_id: &UserId) -> Result<Account>;

    // =========================================================================
    // Ledger
    // =========================================================================

    /// Apply a transaction to its user's balance and record it atomically.
    ///
    /// Only `Completed` transactions move the balance. The account is
    /// created lazily.
    ///
    /// # Errors
    ///
    /// - `StoreError::InsufficientCredits` if a debit exceeds the balance.
    /// - `StoreError::DuplicateRefund` if the transaction is a refund for a
    ///   job that already has one.
    fn commit_transaction(&self, transaction: Transaction) -> Result<BalanceChange>;

    /// Get a transaction by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_transaction(&self, transaction_id: &TransactionId) -> Result<Option<Transaction>>;

    /// List transactions for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_transactions_by_user(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Transaction>>;

    /// Sum the amounts of all of a user's transactions.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn sum_transactions(&self, user_id: &UserId) -> Result<i64>;

    /// Find the completed refund recorded for a job, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_refund(&self, job_id: &JobId) -> Result<Option<TransactionId>>;

    // =========================================================================
    // Jobs
    // =========================================================================

    /// Record a new pending job together with the reservation that pays for it.
    ///
    /// # Errors
    ///
    /// - `StoreError::InsufficientCredits` if the reservation exceeds the balance.
    fn open_job(&self, job: &Job, reservation: Transaction) -> Result<BalanceChange>;

    /// Write a job's terminal state, with its refund if one is given.
    ///
    /// The stored job must still be pending; the check and the write happen
    /// under the user's lock so two settlers cannot both succeed.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the job does not exist.
    /// - `StoreError::JobAlreadySettled` if the stored job is terminal.
    /// - `StoreError::DuplicateRefund` if the job already has a refund.
    fn settle_job(&self, job: &Job, refund: Option<Transaction>) -> Result<Option<BalanceChange>>;

    /// Get a job by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_job(&self, job_id: &JobId) -> Result<Option<Job>>;

    /// List a user's jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_jobs_by_user(&self, user_id: &UserId, limit: usize, offset: usize)
        -> Result<Vec<Job>>;

    /// List jobs that are still pending, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_pending_jobs(&self, limit: usize) -> Result<Vec<Job>>;
}
