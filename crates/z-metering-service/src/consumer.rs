//! The result consumer.
//!
//! Drains the result topic into the [`SettlementEngine`], one message at a
//! time. Messages that cannot be decoded are logged and dropped so they do
//! not block the queue; a settlement error requeues the message and ends the
//! run, leaving the restart to the supervisor.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use z_metering_core::ResultMessage;
use z_metering_queue::{consume, ConsumeOptions, Delivery, DeliveryHandler, MessageQueue};

use crate::error::{ServiceError, SettlementError};
use crate::settlement::SettlementEngine;
use crate::supervisor::{Heartbeat, SupervisedTask};

/// Consumes worker results and settles them.
pub struct ResultConsumer {
    queue: Arc<dyn MessageQueue>,
    settlement: Arc<SettlementEngine>,
    topic: String,
    options: ConsumeOptions,
}

impl ResultConsumer {
    /// Create a consumer for `topic`.
    #[must_use]
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        settlement: Arc<SettlementEngine>,
        topic: impl Into<String>,
        options: ConsumeOptions,
    ) -> Self {
        Self {
            queue,
            settlement,
            topic: topic.into(),
            options,
        }
    }
}

struct ResultHandler {
    settlement: Arc<SettlementEngine>,
    heartbeat: Arc<Heartbeat>,
}

#[async_trait]
impl DeliveryHandler for ResultHandler {
    type Error = SettlementError;

    async fn handle(&self, delivery: &Delivery) -> Result<(), SettlementError> {
        self.heartbeat.beat();

        let message = match ResultMessage::from_bytes(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    tag = delivery.tag,
                    error = %e,
                    "Undecodable result message dropped"
                );
                return Ok(());
            }
        };

        if delivery.redelivered() {
            tracing::info!(
                job_id = %message.job_id,
                attempts = delivery.attempts,
                "Processing redelivered result"
            );
        }

        let outcome = self
            .settlement
            .settle(message.job_id, message.result, &message.worker_id)?;
        tracing::debug!(outcome = ?outcome, "Result handled");
        Ok(())
    }

    fn on_poll(&self) {
        self.heartbeat.beat();
    }
}

#[async_trait]
impl SupervisedTask for ResultConsumer {
    fn name(&self) -> &str {
        "result-consumer"
    }

    async fn run(&self, heartbeat: Arc<Heartbeat>, cancel: CancellationToken) -> Result<(), ServiceError> {
        tracing::info!(topic = %self.topic, "Result consumer running");
        let handler = ResultHandler {
            settlement: Arc::clone(&self.settlement),
            heartbeat,
        };
        consume(self.queue.as_ref(), &self.topic, &handler, self.options, &cancel).await?;
        Ok(())
    }

    async fn recover(&self) -> Result<(), ServiceError> {
        let released = self.queue.recover(&self.topic).await?;
        if released > 0 {
            tracing::info!(topic = %self.topic, released = released, "Requeued unacknowledged results");
        }
        Ok(())
    }
}
