//! Job Queue Bridge for z-metering.
//!
//! Tasks flow to the external worker and results flow back through a
//! [`MessageQueue`]. Every backend gives at-least-once delivery with
//! explicit acknowledgement: a message leaves the queue only when it is
//! acked, and a nacked or abandoned lease makes it deliverable again.
//!
//! Backends:
//!
//! - [`MemoryQueue`]: in-process, not durable. Tests and embedding.
//! - [`RocksQueue`]: embedded and durable across restarts.
//! - [`PgQueue`]: PostgreSQL, shared between processes.
//!
//! [`consume`] drives a handler with one message in flight at a time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod postgres;
pub mod rocks;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use error::{ConsumeError, QueueError, Result};
pub use memory::MemoryQueue;
pub use postgres::PgQueue;
pub use rocks::RocksQueue;

/// A leased message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Topic the message was received from.
    pub topic: String,

    /// Backend-assigned tag identifying the message for ack/nack.
    pub tag: u64,

    /// Message body.
    pub payload: Vec<u8>,

    /// How many times the message has been delivered, this one included.
    pub attempts: u32,
}

impl Delivery {
    /// Whether the message was delivered before.
    #[must_use]
    pub const fn redelivered(&self) -> bool {
        self.attempts > 1
    }
}

/// An at-least-once message queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Durably enqueue a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message could not be persisted.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Lease the oldest available message, waiting up to `wait` for one.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn receive(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>>;

    /// Remove a leased message permanently.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::UnknownDelivery` if the delivery is not leased.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return a leased message to the queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::UnknownDelivery` if the delivery is not leased.
    async fn nack(&self, delivery: Delivery) -> Result<()>;

    /// Release every lease this handle holds on `topic`, as a broker does
    /// when a consumer's channel dies. Returns the number of messages freed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn recover(&self, topic: &str) -> Result<usize>;

    /// Number of unacknowledged messages on `topic`, leased or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    async fn depth(&self, topic: &str) -> Result<usize>;
}

/// Processes deliveries for [`consume`].
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Error that aborts consumption.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Handle one delivery. Returning `Ok` acks it.
    async fn handle(&self, delivery: &Delivery) -> std::result::Result<(), Self::Error>;

    /// Called once per receive attempt, whether or not a message arrived.
    fn on_poll(&self) {}
}

/// Options for [`consume`].
#[derive(Debug, Clone, Copy)]
pub struct ConsumeOptions {
    /// How long a single receive waits before polling again.
    pub poll_interval: Duration,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Drain `topic` into `handler` until cancelled.
///
/// One message is in flight at a time. A delivery is acked after the
/// handler returns `Ok`; on `Err` it is nacked and consumption stops so the
/// caller can decide whether to restart.
///
/// # Errors
///
/// - `ConsumeError::Queue` if the queue fails.
/// - `ConsumeError::Handler` if the handler rejects a delivery.
pub async fn consume<H: DeliveryHandler>(
    queue: &dyn MessageQueue,
    topic: &str,
    handler: &H,
    options: ConsumeOptions,
    cancel: &CancellationToken,
) -> std::result::Result<(), ConsumeError<H::Error>> {
    loop {
        handler.on_poll();

        let delivery = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            received = queue.receive(topic, options.poll_interval) => received?,
        };
        let Some(delivery) = delivery else {
            continue;
        };

        tracing::debug!(
            topic = %topic,
            tag = delivery.tag,
            attempts = delivery.attempts,
            "Delivery received"
        );

        match handler.handle(&delivery).await {
            Ok(()) => queue.ack(&delivery).await?,
            Err(e) => {
                tracing::warn!(topic = %topic, tag = delivery.tag, error = %e, "Handler failed, requeueing");
                queue.nack(delivery).await?;
                return Err(ConsumeError::Handler(e));
            }
        }
    }
}

/// Check a topic name for the in-process backends.
pub(crate) fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.contains('\0') {
        return Err(QueueError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// Poll `try_take` until it yields a delivery or `wait` elapses, parking on
/// `notify` between attempts.
pub(crate) async fn wait_for_delivery<F>(
    notify: &Notify,
    wait: Duration,
    mut try_take: F,
) -> Result<Option<Delivery>>
where
    F: FnMut() -> Result<Option<Delivery>>,
{
    let deadline = Instant::now() + wait;
    loop {
        let notified = notify.notified();
        if let Some(delivery) = try_take()? {
            return Ok(Some(delivery));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
            return Ok(None);
        }
    }
}
