//! Service error types.

use z_metering_queue::{ConsumeError, QueueError};
use z_metering_store::StoreError;

/// Errors raised by the [`crate::Ledger`].
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Amounts must be strictly positive.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// The balance does not cover the debit.
    #[error("insufficient funds: balance={balance}, required={required}")]
    InsufficientFunds {
        /// Current balance.
        balance: i64,
        /// Required amount.
        required: i64,
    },

    /// The job already has a completed refund.
    #[error("job {job_id} already refunded by transaction {transaction_id}")]
    DuplicateRefund {
        /// The job ID.
        job_id: String,
        /// The existing refund.
        transaction_id: String,
    },

    /// The job reached a terminal status before this write.
    #[error("job {job_id} already settled as {status}")]
    AlreadySettled {
        /// The job ID.
        job_id: String,
        /// Its stored status.
        status: &'static str,
    },

    /// Storage failure.
    #[error(transparent)]
    Storage(StoreError),
}

impl LedgerError {
    /// Whether retrying, possibly by another path, may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientCredits { balance, required } => {
                Self::InsufficientFunds { balance, required }
            }
            StoreError::DuplicateRefund {
                job_id,
                transaction_id,
            } => Self::DuplicateRefund {
                job_id,
                transaction_id,
            },
            StoreError::JobAlreadySettled { job_id, status } => {
                Self::AlreadySettled { job_id, status }
            }
            other => Self::Storage(other),
        }
    }
}

/// Errors returned to the caller of [`crate::AdmissionController::admit`].
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// Cost must be strictly positive.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// The input is missing fields the worker requires.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The balance does not cover the cost. No job was created.
    #[error("payment required: balance={balance}, required={required}")]
    PaymentRequired {
        /// Current balance.
        balance: i64,
        /// Job cost.
        required: i64,
    },

    /// The task could not be handed to the queue. The reservation was
    /// compensated and the job marked failed.
    #[error("dispatch failed for job {job_id}: {reason}")]
    Dispatch {
        /// The failed job.
        job_id: String,
        /// What went wrong.
        reason: String,
    },

    /// Storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] LedgerError),
}

impl AdmissionError {
    /// HTTP status an API layer should answer with.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::InvalidAmount(_) | Self::InvalidInput(_) => 400,
            Self::PaymentRequired { .. } => 402,
            Self::Dispatch { .. } | Self::Storage(_) => 500,
        }
    }
}

/// Errors that abort settlement of a result.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    /// Reading or writing the ledger failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The compensating refund failed on every write path.
    #[error("refund for job {job_id} failed: {source}")]
    RefundFailed {
        /// The job left unrefunded.
        job_id: String,
        /// The last failure.
        source: LedgerError,
    },
}

/// Top-level service errors.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Storage failure.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Queue failure.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Settlement failure.
    #[error("settlement error: {0}")]
    Settlement(#[from] SettlementError),

    /// Record not found, or not visible to the caller.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Its identifier.
        id: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors loading [`crate::ServiceConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("{key}: invalid value {value:?}")]
    Invalid {
        /// The variable.
        key: &'static str,
        /// What it was set to.
        value: String,
    },

    /// A variable the selected setup needs is not set.
    #[error("{key} is required{context}")]
    Missing {
        /// The variable.
        key: &'static str,
        /// Why it is needed.
        context: &'static str,
    },

    /// The classifier rules file could not be read.
    #[error("classifier rules {path}: {source}")]
    RulesFile {
        /// The file.
        path: String,
        /// The read failure.
        source: std::io::Error,
    },

    /// The classifier rules file is not valid JSON rules.
    #[error("classifier rules {path}: {source}")]
    RulesFormat {
        /// The file.
        path: String,
        /// The parse failure.
        source: serde_json::Error,
    },
}

impl From<ConsumeError<SettlementError>> for ServiceError {
    fn from(err: ConsumeError<SettlementError>) -> Self {
        match err {
            ConsumeError::Queue(e) => Self::Queue(e),
            ConsumeError::Handler(e) => Self::Settlement(e),
        }
    }
}
