//! PostgreSQL-backed queue.
//!
//! Rows are leased with `FOR UPDATE SKIP LOCKED` and a visibility timeout,
//! so several processes can share a topic and a lease abandoned by a dead
//! consumer expires on its own. Acking deletes the row.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;

use crate::error::{QueueError, Result};
use crate::{Delivery, MessageQueue};

/// Interval between lease attempts while waiting in `receive`.
const POLL_STEP: Duration = Duration::from_millis(250);

const MIGRATIONS: &[&str] = &[
    r"
CREATE TABLE IF NOT EXISTS queue_messages (
    id BIGSERIAL PRIMARY KEY,
    topic TEXT NOT NULL,
    payload BYTEA NOT NULL,
    attempts INT NOT NULL DEFAULT 0,
    leased_until TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)",
    r"
CREATE INDEX IF NOT EXISTS idx_queue_messages_topic ON queue_messages (topic, id)",
];

/// PostgreSQL queue adapter.
pub struct PgQueue {
    pool: PgPool,
    visibility_timeout: Duration,
    leased: Mutex<HashMap<i64, String>>,
}

impl PgQueue {
    /// Connect to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot connect.
    pub async fn connect(database_url: &str, visibility_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::with_pool(pool, visibility_timeout))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn with_pool(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            leased: Mutex::new(HashMap::new()),
        }
    }

    /// Create the queue table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if a statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn try_lease(&self, topic: &str) -> Result<Option<Delivery>> {
        let row = sqlx::query(
            r"
            UPDATE queue_messages
            SET leased_until = NOW() + make_interval(secs => $2),
                attempts = attempts + 1
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE topic = $1 AND (leased_until IS NULL OR leased_until < NOW())
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, payload, attempts
            ",
        )
        .bind(topic)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: i64 = row.try_get("id")?;
        let payload: Vec<u8> = row.try_get("payload")?;
        let attempts: i32 = row.try_get("attempts")?;

        self.leased.lock().insert(id, topic.to_string());

        Ok(Some(Delivery {
            topic: topic.to_string(),
            tag: tag_of(id)?,
            payload,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        }))
    }

    fn unknown(delivery: &Delivery) -> QueueError {
        QueueError::UnknownDelivery {
            topic: delivery.topic.clone(),
            tag: delivery.tag,
        }
    }
}

fn tag_of(id: i64) -> Result<u64> {
    u64::try_from(id).map_err(|_| QueueError::Backend(format!("negative message id {id}")))
}

fn id_of(delivery: &Delivery) -> Result<i64> {
    i64::try_from(delivery.tag).map_err(|_| PgQueue::unknown(delivery))
}

#[async_trait]
impl MessageQueue for PgQueue {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        sqlx::query("INSERT INTO queue_messages (topic, payload) VALUES ($1, $2)")
            .bind(topic)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn receive(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_lease(topic).await? {
                return Ok(Some(delivery));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(POLL_STEP)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let id = id_of(delivery)?;
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = $1 AND topic = $2")
            .bind(id)
            .bind(&delivery.topic)
            .execute(&self.pool)
            .await?;

        self.leased.lock().remove(&id);
        if result.rows_affected() == 0 {
            return Err(Self::unknown(delivery));
        }
        Ok(())
    }

    async fn nack(&self, delivery: Delivery) -> Result<()> {
        let id = id_of(&delivery)?;
        let result = sqlx::query(
            "UPDATE queue_messages SET leased_until = NULL WHERE id = $1 AND topic = $2",
        )
        .bind(id)
        .bind(&delivery.topic)
        .execute(&self.pool)
        .await?;

        self.leased.lock().remove(&id);
        if result.rows_affected() == 0 {
            return Err(Self::unknown(&delivery));
        }
        Ok(())
    }

    async fn recover(&self, topic: &str) -> Result<usize> {
        let ids: Vec<i64> = {
            let mut leased = self.leased.lock();
            let ids: Vec<i64> = leased
                .iter()
                .filter(|(_, t)| t.as_str() == topic)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                leased.remove(id);
            }
            ids
        };
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "UPDATE queue_messages SET leased_until = NULL WHERE topic = $1 AND id = ANY($2)",
        )
        .bind(topic)
        .bind(&ids)
        .execute(&self.pool)
        .await?;

        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn depth(&self, topic: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE topic = $1")
            .bind(topic)
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}
