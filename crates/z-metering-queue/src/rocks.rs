//! Durable embedded queue on `RocksDB`.
//!
//! Messages are keyed `topic || 0x00 || seq` (seq is a big-endian `u64`), so
//! a prefix scan walks a topic oldest first. A message is deleted only when
//! acked; leases live in memory, so every unacknowledged message becomes
//! deliverable again after a restart.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode, Options, DB};
use tokio::sync::Notify;

use crate::error::{QueueError, Result};
use crate::{validate_topic, wait_for_delivery, Delivery, MessageQueue};

#[derive(Default)]
struct Leases {
    leased: HashSet<Vec<u8>>,
    attempts: HashMap<Vec<u8>, u32>,
}

/// RocksDB-backed durable queue.
pub struct RocksQueue {
    db: DB,
    next_seq: AtomicU64,
    leases: Mutex<Leases>,
    notify: Notify,
}

fn topic_prefix(topic: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(topic.len() + 1);
    prefix.extend_from_slice(topic.as_bytes());
    prefix.push(0);
    prefix
}

fn message_key(topic: &str, seq: u64) -> Vec<u8> {
    let mut key = topic_prefix(topic);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn seq_of(key: &[u8]) -> Option<u64> {
    let tail = key.len().checked_sub(8).map(|start| &key[start..])?;
    <[u8; 8]>::try_from(tail).ok().map(u64::from_be_bytes)
}

impl RocksQueue {
    /// Open or create a queue database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;

        let mut max_seq = None;
        for item in db.iterator(IteratorMode::Start) {
            let (key, _) = item?;
            max_seq = max_seq.max(seq_of(&key));
        }
        let next_seq = max_seq.map_or(0, |seq| seq + 1);

        tracing::debug!(next_seq, "Queue opened");

        Ok(Self {
            db,
            next_seq: AtomicU64::new(next_seq),
            leases: Mutex::new(Leases::default()),
            notify: Notify::new(),
        })
    }

    fn try_take(&self, topic: &str) -> Result<Option<Delivery>> {
        let prefix = topic_prefix(topic);
        let mut leases = self.leases.lock();

        for item in self
            .db
            .iterator(IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if leases.leased.contains(&*key) {
                continue;
            }
            let Some(tag) = seq_of(&key) else {
                continue;
            };

            let attempts = {
                let count = leases.attempts.entry(key.to_vec()).or_insert(0);
                *count += 1;
                *count
            };
            leases.leased.insert(key.to_vec());

            return Ok(Some(Delivery {
                topic: topic.to_string(),
                tag,
                payload: value.to_vec(),
                attempts,
            }));
        }
        Ok(None)
    }

    fn release(&self, leases: &mut Leases, delivery: &Delivery) -> Result<Vec<u8>> {
        let key = message_key(&delivery.topic, delivery.tag);
        if leases.leased.remove(&key) {
            Ok(key)
        } else {
            Err(QueueError::UnknownDelivery {
                topic: delivery.topic.clone(),
                tag: delivery.tag,
            })
        }
    }
}

#[async_trait]
impl MessageQueue for RocksQueue {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        validate_topic(topic)?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.db.put(message_key(topic, seq), payload)?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>> {
        validate_topic(topic)?;
        wait_for_delivery(&self.notify, wait, || self.try_take(topic)).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut leases = self.leases.lock();
        let key = self.release(&mut leases, delivery)?;
        if let Err(e) = self.db.delete(&key) {
            leases.leased.insert(key);
            return Err(e.into());
        }
        leases.attempts.remove(&key);
        Ok(())
    }

    async fn nack(&self, delivery: Delivery) -> Result<()> {
        self.release(&mut self.leases.lock(), &delivery)?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn recover(&self, topic: &str) -> Result<usize> {
        let prefix = topic_prefix(topic);
        let freed = {
            let mut leases = self.leases.lock();
            let before = leases.leased.len();
            leases.leased.retain(|key| !key.starts_with(&prefix));
            before - leases.leased.len()
        };
        if freed > 0 {
            self.notify.notify_waiters();
        }
        Ok(freed)
    }

    async fn depth(&self, topic: &str) -> Result<usize> {
        let prefix = topic_prefix(topic);
        let mut count = 0;
        for item in self
            .db
            .iterator(IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_queue() -> (RocksQueue, TempDir) {
        let dir = TempDir::new().unwrap();
        let queue = RocksQueue::open(dir.path()).unwrap();
        (queue, dir)
    }

    #[test]
    fn keys_sort_by_sequence() {
        assert!(message_key("t", 1) < message_key("t", 2));
        assert!(message_key("t", 255) < message_key("t", 256));
        assert_eq!(seq_of(&message_key("t", 42)), Some(42));
    }

    #[test]
    fn prefixes_do_not_overlap() {
        assert!(!message_key("ab", 0).starts_with(&topic_prefix("a")));
    }

    #[tokio::test]
    async fn messages_survive_reopen_until_acked() {
        let dir = TempDir::new().unwrap();
        {
            let queue = RocksQueue::open(dir.path()).unwrap();
            queue.publish("ml_results", b"one").await.unwrap();
            queue.publish("ml_results", b"two").await.unwrap();

            let leased = queue
                .receive("ml_results", Duration::ZERO)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(leased.payload, b"one");
        }

        let queue = RocksQueue::open(dir.path()).unwrap();
        assert_eq!(queue.depth("ml_results").await.unwrap(), 2);

        let first = queue
            .receive("ml_results", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.payload, b"one");
        queue.ack(&first).await.unwrap();

        queue.publish("ml_results", b"three").await.unwrap();
        let second = queue
            .receive("ml_results", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.payload, b"two");
        assert_eq!(queue.depth("ml_results").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn leased_messages_are_skipped() {
        let (queue, _dir) = create_test_queue();
        queue.publish("t", b"a").await.unwrap();
        queue.publish("t", b"b").await.unwrap();

        let a = queue.receive("t", Duration::ZERO).await.unwrap().unwrap();
        let b = queue.receive("t", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(a.payload, b"a");
        assert_eq!(b.payload, b"b");
        assert!(queue.receive("t", Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nack_and_recover_make_messages_available() {
        let (queue, _dir) = create_test_queue();
        queue.publish("t", b"a").await.unwrap();
        queue.publish("t", b"b").await.unwrap();

        let a = queue.receive("t", Duration::ZERO).await.unwrap().unwrap();
        queue.nack(a).await.unwrap();
        let a_again = queue.receive("t", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(a_again.payload, b"a");
        assert_eq!(a_again.attempts, 2);

        let _b = queue.receive("t", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(queue.recover("t").await.unwrap(), 2);
        assert_eq!(queue.recover("t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ack_of_unleased_delivery_fails() {
        let (queue, _dir) = create_test_queue();
        let bogus = Delivery {
            topic: "t".into(),
            tag: 7,
            payload: Vec::new(),
            attempts: 1,
        };
        assert!(matches!(
            queue.ack(&bogus).await,
            Err(QueueError::UnknownDelivery { tag: 7, .. })
        ));
    }
}
