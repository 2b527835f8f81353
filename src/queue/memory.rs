use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{Acknowledger, DeadLetter, Delivery, JobQueue, QueueStats, Subscription};
use crate::{Error, JobDescriptor, Result};

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    delivery_count: u32,
}

struct Unacked {
    consumer: u64,
    message: Message,
}

struct Shared {
    name: String,
    ready_tx: Sender<Message>,
    ready_rx: Receiver<Message>,
    unacked: Mutex<HashMap<i64, Unacked>>,
    dead: Mutex<Vec<DeadLetter>>,
    next_tag: AtomicI64,
    next_consumer: AtomicU64,
    consumers: AtomicUsize,
}

impl Shared {
    fn take(&self, tag: i64) -> Result<Message> {
        self.unacked
            .lock()
            .remove(&tag)
            .map(|unacked| unacked.message)
            .ok_or_else(|| Error::queue(format!("unknown delivery tag {tag}")))
    }

    fn push_back(&self, message: Message) {
        // The channel is unbounded, so this only fails once the queue is closed.
        if self.ready_tx.try_send(message).is_err() {
            debug!(queue = %self.name, "Queue closed, dropping returned message");
        }
    }
}

#[async_trait]
impl Acknowledger for Shared {
    async fn ack(&self, tag: i64) -> Result<()> {
        self.take(tag).map(|_| ())
    }

    async fn requeue(&self, tag: i64) -> Result<()> {
        let message = self.take(tag)?;
        self.push_back(message);
        Ok(())
    }

    async fn dead_letter(&self, tag: i64, reason: &str) -> Result<()> {
        let message = self.take(tag)?;
        self.dead.lock().push(DeadLetter {
            queue_name: self.name.clone(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            reason: reason.to_string(),
            delivery_count: message.delivery_count,
            dead_at: Utc::now(),
        });
        Ok(())
    }
}

/// In-process queue for single-binary deployments and tests.
#[derive(Clone)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        let (ready_tx, ready_rx) = async_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                ready_tx,
                ready_rx,
                unacked: Mutex::new(HashMap::new()),
                dead: Mutex::new(Vec::new()),
                next_tag: AtomicI64::new(0),
                next_consumer: AtomicU64::new(0),
                consumers: AtomicUsize::new(0),
            }),
        }
    }

    /// Enqueues bytes as-is, bypassing descriptor encoding.
    pub async fn publish_raw(&self, payload: Vec<u8>) -> Result<()> {
        self.shared
            .ready_tx
            .send(Message {
                payload,
                delivery_count: 0,
            })
            .await
            .map_err(|_| Error::queue(format!("queue {} is closed", self.shared.name)))
    }

    /// Deliveries handed out and not yet settled.
    pub fn unacked(&self) -> usize {
        self.shared.unacked.lock().len()
    }

    /// Makes the queue unavailable; consumers drain what is left and then stop.
    pub fn close(&self) {
        self.shared.ready_tx.close();
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn publish(&self, descriptor: &JobDescriptor) -> Result<()> {
        self.publish_raw(serde_json::to_vec(descriptor)?).await
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        if self.shared.ready_tx.is_closed() {
            return Err(Error::queue(format!("queue {} is closed", self.shared.name)));
        }

        let id = self.shared.next_consumer.fetch_add(1, Ordering::SeqCst);
        self.shared.consumers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySubscription {
            id,
            tag: format!("{}-consumer-{id}", self.shared.name),
            shared: self.shared.clone(),
        }))
    }

    async fn stats(&self) -> Result<Option<QueueStats>> {
        if self.shared.ready_tx.is_closed() {
            return Ok(None);
        }

        Ok(Some(QueueStats {
            depth: self.shared.ready_rx.len() as u64,
            consumer_count: self.shared.consumers.load(Ordering::SeqCst) as u64,
        }))
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        Ok(self
            .shared
            .dead
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

struct MemorySubscription {
    id: u64,
    tag: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn consumer_tag(&self) -> &str {
        &self.tag
    }

    async fn next(&mut self) -> Result<Delivery> {
        let mut message = self
            .shared
            .ready_rx
            .recv()
            .await
            .map_err(|_| Error::queue(format!("queue {} is closed", self.shared.name)))?;
        message.delivery_count += 1;

        let tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.unacked.lock().insert(
            tag,
            Unacked {
                consumer: self.id,
                message: message.clone(),
            },
        );

        Ok(Delivery::new(
            tag,
            message.payload,
            message.delivery_count,
            self.shared.clone(),
        ))
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.shared.consumers.fetch_sub(1, Ordering::SeqCst);

        let orphaned: Vec<Message> = {
            let mut unacked = self.shared.unacked.lock();
            let tags: Vec<i64> = unacked
                .iter()
                .filter(|(_, u)| u.consumer == self.id)
                .map(|(tag, _)| *tag)
                .collect();
            tags.iter()
                .filter_map(|tag| unacked.remove(tag))
                .map(|u| u.message)
                .collect()
        };

        if !orphaned.is_empty() {
            debug!(consumer = %self.tag, count = orphaned.len(), "Returning unacked deliveries");
        }
        for message in orphaned {
            self.shared.push_back(message);
        }
    }
}
