//! Error types for the queue bridge.

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur talking to a queue backend.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The backend failed. Usually transient.
    #[error("queue backend error: {0}")]
    Backend(String),

    /// Topic names must be non-empty and free of NUL bytes.
    #[error("invalid topic name: {0:?}")]
    InvalidTopic(String),

    /// An ack or nack named a delivery that is not currently leased.
    #[error("unknown delivery {tag} on topic {topic}")]
    UnknownDelivery {
        /// The topic.
        topic: String,
        /// The delivery tag.
        tag: u64,
    },
}

impl From<rocksdb::Error> for QueueError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Error returned by [`crate::consume`].
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError<E: std::error::Error + 'static> {
    /// The queue itself failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The handler rejected a delivery; it was requeued.
    #[error("handler failed: {0}")]
    Handler(#[source] E),
}
