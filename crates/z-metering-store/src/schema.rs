//! Database schema definitions and column families.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Account records, keyed by `user_id`.
    pub const ACCOUNTS: &str = "accounts";

    /// Ledger transactions, keyed by `transaction_id` (ULID).
    pub const TRANSACTIONS: &str = "transactions";

    /// Index: transactions by user, keyed by `user_id || transaction_id`.
    /// Value is empty (index only).
    pub const TRANSACTIONS_BY_USER: &str = "transactions_by_user";

    /// Job records, keyed by `job_id` (ULID).
    pub const JOBS: &str = "jobs";

    /// Index: jobs by user, keyed by `user_id || job_id`. Value is empty.
    pub const JOBS_BY_USER: &str = "jobs_by_user";

    /// Index: jobs still waiting for a result, keyed by `job_id`.
    /// Value is empty. Entries are removed when the job settles.
    pub const PENDING_JOBS: &str = "pending_jobs";

    /// Refund idempotency anchor, keyed by `job_id`.
    /// Value is the refund's `transaction_id`.
    pub const REFUNDS_BY_JOB: &str = "refunds_by_job";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::ACCOUNTS,
        cf::TRANSACTIONS,
        cf::TRANSACTIONS_BY_USER,
        cf::JOBS,
        cf::JOBS_BY_USER,
        cf::PENDING_JOBS,
        cf::REFUNDS_BY_JOB,
    ]
}
