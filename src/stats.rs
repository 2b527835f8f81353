//! Read-only queue health snapshot for operators

use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::queue::JobQueue;

const QUEUE_UNAVAILABLE: &str = "Queue not found or not accessible";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueHealth {
    Available,
    Unavailable,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatsReport {
    pub queue_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_count: Option<u64>,
    pub status: QueueHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct QueueStatsReporter {
    queue: Arc<dyn JobQueue>,
}

impl QueueStatsReporter {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Never fails; problems are reported in the snapshot itself.
    pub async fn report(&self) -> QueueStatsReport {
        let queue_name = self.queue.name().to_string();
        match self.queue.stats().await {
            Ok(Some(stats)) => QueueStatsReport {
                queue_name,
                depth: Some(stats.depth),
                consumer_count: Some(stats.consumer_count),
                status: QueueHealth::Available,
                error: None,
            },
            Ok(None) => QueueStatsReport {
                queue_name,
                depth: None,
                consumer_count: None,
                status: QueueHealth::Unavailable,
                error: Some(QUEUE_UNAVAILABLE.to_string()),
            },
            Err(err) => {
                warn!(queue = %queue_name, error = %err, "Failed to read queue stats");
                QueueStatsReport {
                    queue_name,
                    depth: None,
                    consumer_count: None,
                    status: QueueHealth::Error,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}
