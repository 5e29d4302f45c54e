//! In-memory queue.
//!
//! FIFO per topic. Nothing survives the process, so this backend is only
//! suitable for tests and single-process embedding.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{QueueError, Result};
use crate::{validate_topic, wait_for_delivery, Delivery, MessageQueue};

struct Message {
    tag: u64,
    payload: Vec<u8>,
    attempts: u32,
}

#[derive(Default)]
struct Topic {
    ready: VecDeque<Message>,
    leased: HashMap<u64, Message>,
}

/// In-process queue.
#[derive(Default)]
pub struct MemoryQueue {
    topics: Mutex<HashMap<String, Topic>>,
    next_tag: AtomicU64,
    notify: Notify,
}

impl MemoryQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(&self, topic: &str) -> Option<Delivery> {
        let mut topics = self.topics.lock();
        let state = topics.get_mut(topic)?;
        let mut message = state.ready.pop_front()?;
        message.attempts += 1;

        let delivery = Delivery {
            topic: topic.to_string(),
            tag: message.tag,
            payload: message.payload.clone(),
            attempts: message.attempts,
        };
        state.leased.insert(message.tag, message);
        Some(delivery)
    }

    fn release(&self, delivery: &Delivery) -> Result<Message> {
        let mut topics = self.topics.lock();
        topics
            .get_mut(&delivery.topic)
            .and_then(|state| state.leased.remove(&delivery.tag))
            .ok_or_else(|| QueueError::UnknownDelivery {
                topic: delivery.topic.clone(),
                tag: delivery.tag,
            })
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        validate_topic(topic)?;
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .ready
            .push_back(Message {
                tag,
                payload: payload.to_vec(),
                attempts: 0,
            });
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, topic: &str, wait: Duration) -> Result<Option<Delivery>> {
        validate_topic(topic)?;
        wait_for_delivery(&self.notify, wait, || Ok(self.try_take(topic))).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.release(delivery).map(|_| ())
    }

    async fn nack(&self, delivery: Delivery) -> Result<()> {
        let message = self.release(&delivery)?;
        if let Some(state) = self.topics.lock().get_mut(&delivery.topic) {
            state.ready.push_front(message);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn recover(&self, topic: &str) -> Result<usize> {
        let mut topics = self.topics.lock();
        let Some(state) = topics.get_mut(topic) else {
            return Ok(0);
        };

        let mut leased: Vec<Message> = state.leased.drain().map(|(_, m)| m).collect();
        let count = leased.len();
        leased.sort_by_key(|m| std::cmp::Reverse(m.tag));
        for message in leased {
            state.ready.push_front(message);
        }
        drop(topics);

        if count > 0 {
            self.notify.notify_waiters();
        }
        Ok(count)
    }

    async fn depth(&self, topic: &str) -> Result<usize> {
        Ok(self
            .topics
            .lock()
            .get(topic)
            .map_or(0, |state| state.ready.len() + state.leased.len()))
    }
}
