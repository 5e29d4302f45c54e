//! Error types for z-metering core types.

use crate::ids::IdError;
use crate::JobStatus;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, MeteringError>;

/// Errors raised by core types.
#[derive(Debug, thiserror::Error)]
pub enum MeteringError {
    /// A settled job was asked to settle again.
    #[error("job {job_id} already settled as {status:?}")]
    AlreadySettled {
        /// The job ID.
        job_id: String,
        /// Its terminal status.
        status: JobStatus,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}
