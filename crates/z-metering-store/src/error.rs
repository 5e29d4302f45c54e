//! Error types for z-metering storage.

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed. Usually transient.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Its identifier.
        id: String,
    },

    /// A debit exceeds the account balance.
    #[error("insufficient credits: balance={balance}, required={required}")]
    InsufficientCredits {
        /// Current balance.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// The job has already reached a terminal status.
    #[error("job {job_id} already settled as {status}")]
    JobAlreadySettled {
        /// The job ID.
        job_id: String,
        /// Its stored status.
        status: &'static str,
    },

    /// Applying the amount would overflow the balance.
    #[error("balance overflow: balance={balance}, delta={delta}")]
    BalanceOverflow {
        /// Balance before the change.
        balance: i64,
        /// The rejected amount.
        delta: i64,
    },

    /// A completed refund already exists for the job.
    #[error("job {job_id} already refunded by transaction {transaction_id}")]
    DuplicateRefund {
        /// The job ID.
        job_id: String,
        /// The existing refund transaction.
        transaction_id: String,
    },
}

impl StoreError {
    /// Whether retrying the operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Database(err.to_string())
    }
}
