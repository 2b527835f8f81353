//! Durable job queue contract
//!
//! Every delivery goes to one consumer at a time and has to be settled
//! explicitly: acked, requeued, or moved to the dead-letter channel. A
//! consumer that goes away without settling hands its deliveries back to the
//! live queue, so processing is at-least-once.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::{Error, JobDescriptor, Result};

pub use memory::MemoryQueue;
pub use postgres::PgJobQueue;

/// Point-in-time snapshot, possibly stale by the time it is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Messages waiting for a consumer
    pub depth: u64,
    pub consumer_count: u64,
}

/// A message whose processing was abandoned, kept for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub queue_name: String,
    pub payload: String,
    pub reason: String,
    pub delivery_count: u32,
    pub dead_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue a copy of `descriptor`. An error means the job will never run.
    async fn publish(&self, descriptor: &JobDescriptor) -> Result<()>;

    /// Register a new consumer.
    async fn subscribe(&self) -> Result<Box<dyn Subscription>>;

    /// `None` when the queue does not exist.
    async fn stats(&self) -> Result<Option<QueueStats>>;

    /// Most recent dead letters first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

#[async_trait]
pub trait Subscription: Send {
    fn consumer_tag(&self) -> &str;

    /// Waits for the next delivery.
    async fn next(&mut self) -> Result<Delivery>;
}

/// Settles deliveries on behalf of a queue backend.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, tag: i64) -> Result<()>;

    async fn requeue(&self, tag: i64) -> Result<()>;

    async fn dead_letter(&self, tag: i64, reason: &str) -> Result<()>;
}

pub struct Delivery {
    tag: i64,
    payload: Vec<u8>,
    delivery_count: u32,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        tag: i64,
        payload: Vec<u8>,
        delivery_count: u32,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            tag,
            payload,
            delivery_count,
            acker,
        }
    }

    pub fn tag(&self) -> i64 {
        self.tag
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Includes this delivery, so a first delivery counts 1.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }

    pub fn descriptor(&self) -> Result<JobDescriptor> {
        serde_json::from_slice(&self.payload).map_err(|e| Error::InvalidDescriptor(e.to_string()))
    }

    /// Removes the message permanently.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack(self.tag).await
    }

    /// Puts the message back on the live queue.
    pub async fn requeue(self) -> Result<()> {
        self.acker.requeue(self.tag).await
    }

    /// Rejects without requeue: the message leaves the live queue for the dead-letter channel.
    pub async fn dead_letter(self, reason: &str) -> Result<()> {
        self.acker.dead_letter(self.tag, reason).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}
