use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

use crate::blob::{sanitize_file_name, BlobStore};
use crate::config::WorkerConfig;
use crate::format::{self, FileFormat};
use crate::queue::{Delivery, JobQueue, Subscription};
use crate::table::TableWriter;
use crate::{Error, JobDescriptor, Result};

/// Status events sent from workers to the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkMessage {
    JobStarted(Uuid),
    JobCompleted(Uuid, u64),
    JobRetrying { job_id: Uuid, attempt: u32, reason: String },
    JobFailed(Uuid, String),
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed { rows: u64 },
    Retried { attempt: u32 },
    DeadLettered { reason: String },
    /// Republishing failed; the original delivery went back to the queue.
    Requeued,
}

#[derive(Clone)]
pub struct JobWorker {
    queue: Arc<dyn JobQueue>,
    blobs: Arc<dyn BlobStore>,
    tables: Arc<dyn TableWriter>,
    config: WorkerConfig,
    events: UnboundedSender<WorkMessage>,
}

impl JobWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        blobs: Arc<dyn BlobStore>,
        tables: Arc<dyn TableWriter>,
        config: WorkerConfig,
        events: UnboundedSender<WorkMessage>,
    ) -> Self {
        Self {
            queue,
            blobs,
            tables,
            config,
            events,
        }
    }

    /// Consumes deliveries until cancelled. A delivery in progress is
    /// finished before the loop checks for cancellation again.
    pub async fn start(self, cancel_token: CancellationToken, mut subscription: Box<dyn Subscription>) {
        debug!(consumer = subscription.consumer_tag(), "Worker started");
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Worker Cancelled");
                    break;
                },
                delivery = subscription.next() => {
                    match delivery {
                        Err(err) => {
                            error!(message = "Error receiving job by worker", error = %err);
                            tokio::select! {
                                _ = cancel_token.cancelled() => break,
                                _ = tokio::time::sleep(self.config.retry_backoff) => {},
                            }
                        },
                        Ok(delivery) => {
                            let outcome = self.handle(delivery).await;
                            debug!(message = "Delivery settled", outcome = ?outcome);
                        }
                    }
                }
            }
        }
        info!("Worker stopped.");
    }

    fn emit(&self, message: WorkMessage) {
        if let Err(err) = self.events.send(message) {
            warn!(message = "Status reconciler is gone, dropping event", event = ?err.0);
        }
    }

    pub async fn handle(&self, delivery: Delivery) -> Outcome {
        match delivery.descriptor() {
            Ok(descriptor) => self.process(delivery, descriptor).await,
            Err(err) => self.reject_undecodable(delivery, err).await,
        }
    }

    async fn reject_undecodable(&self, delivery: Delivery, err: Error) -> Outcome {
        let reason = err.to_string();
        let job_id = serde_json::from_slice::<serde_json::Value>(delivery.payload())
            .ok()
            .and_then(|value| value.get("jobId")?.as_str()?.parse::<Uuid>().ok());
        error!(message = "Undecodable job payload", job_id = ?job_id, error = %reason);

        if let Err(err) = delivery.dead_letter(&reason).await {
            error!(message = "Failed to dead-letter delivery", error = %err);
        }
        if let Some(job_id) = job_id {
            self.emit(WorkMessage::JobFailed(job_id, reason.clone()));
        }
        Outcome::DeadLettered { reason }
    }

    #[instrument(skip_all, fields(job_id = %descriptor.job_id, attempt = descriptor.attempt))]
    async fn process(&self, delivery: Delivery, descriptor: JobDescriptor) -> Outcome {
        let job_id = descriptor.job_id;
        // Crash redeliveries count against the retry budget too.
        let attempt = descriptor.attempt + delivery.delivery_count().saturating_sub(1);
        info!(message = "Processing job", file = %descriptor.file_name, table = descriptor.table());
        self.emit(WorkMessage::JobStarted(job_id));

        match self.run(&descriptor).await {
            Ok(rows) => {
                if let Err(err) = delivery.ack().await {
                    // The table write is idempotent, so a redelivery only repeats it.
                    warn!(message = "Failed to ack processed job", error = %err);
                }
                info!(message = "Job completed", rows);
                self.emit(WorkMessage::JobCompleted(job_id, rows));
                Outcome::Completed { rows }
            }
            Err(err) => self.fail(delivery, descriptor, attempt, err).await,
        }
    }

    async fn fail(
        &self,
        delivery: Delivery,
        descriptor: JobDescriptor,
        attempt: u32,
        err: Error,
    ) -> Outcome {
        let job_id = descriptor.job_id;
        let reason = err.to_string();

        if err.is_permanent() || attempt + 1 >= self.config.max_attempts {
            error!(
                message = "Job failed",
                error = %reason,
                permanent = err.is_permanent(),
                attempts = attempt + 1
            );
            if let Err(err) = delivery.dead_letter(&reason).await {
                error!(message = "Failed to dead-letter delivery", error = %err);
            }
            self.emit(WorkMessage::JobFailed(job_id, reason.clone()));
            return Outcome::DeadLettered { reason };
        }

        let retry = JobDescriptor {
            attempt: attempt + 1,
            ..descriptor
        };
        let delay = self.config.retry_backoff * retry.attempt;
        warn!(message = "Job failed, retrying", error = %reason, next_attempt = retry.attempt, delay = ?delay);
        // Must reach the reconciler before the retry can be claimed and started.
        self.emit(WorkMessage::JobRetrying {
            job_id,
            attempt: retry.attempt,
            reason,
        });
        tokio::time::sleep(delay).await;

        if let Err(publish_err) = self.queue.publish(&retry).await {
            error!(message = "Failed to republish job", error = %publish_err);
            if let Err(err) = delivery.requeue().await {
                error!(message = "Failed to requeue delivery", error = %err);
            }
            return Outcome::Requeued;
        }
        if let Err(err) = delivery.ack().await {
            warn!(message = "Failed to ack retried job", error = %err);
        }
        Outcome::Retried {
            attempt: retry.attempt,
        }
    }

    /// Download, parse, write. The scratch directory goes away with the call.
    async fn run(&self, descriptor: &JobDescriptor) -> Result<u64> {
        tokio::fs::create_dir_all(&self.config.scratch_dir).await?;
        let scratch = tempfile::Builder::new()
            .prefix("lakeq-")
            .tempdir_in(&self.config.scratch_dir)?;
        let local = scratch.path().join(sanitize_file_name(&descriptor.file_name));

        let size = self.download(&descriptor.file_path, &local).await?;
        debug!(message = "Downloaded blob", path = %descriptor.file_path, size);

        let format = FileFormat::detect(&descriptor.file_name)?;
        let rows = format::parse_file(local, format).await?;

        self.tables
            .write_table(
                descriptor.table(),
                descriptor.job_id,
                &rows,
                self.config.write_mode,
            )
            .await
    }

    async fn download(&self, path: &str, local: &Path) -> Result<u64> {
        let mut stream = self.blobs.get(path).await?;
        let mut file = tokio::fs::File::create(local).await?;
        let size = tokio::io::copy(&mut stream, &mut file)
            .await
            .map_err(|e| Error::blob(format!("failed to download {path}: {e}")))?;
        file.flush().await?;
        Ok(size)
    }
}
