use crate::blob::BlobStore;
use crate::config::WorkerConfig;
use crate::queue::JobQueue;
use crate::status::JobStatusStore;
use crate::table::TableWriter;
use crate::worker::{JobWorker, WorkMessage};
use crate::JobStatus;
use anyhow::Error;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Applies worker events to the status store, one at a time.
#[derive(Clone)]
pub struct Reconciler {
    statuses: JobStatusStore,
}

impl Reconciler {
    pub fn new(statuses: JobStatusStore) -> Self {
        Self { statuses }
    }

    pub async fn apply(&self, message: WorkMessage) {
        match message {
            WorkMessage::JobStarted(job_id) => {
                debug!(message = "Starting job", job_id = ?job_id);
                self.statuses
                    .update(job_id, JobStatus::Processing, "Processing started")
                    .await;
            }
            WorkMessage::JobCompleted(job_id, rows) => {
                debug!(message = "Completed job", job_id = ?job_id, rows);
                self.statuses
                    .update(
                        job_id,
                        JobStatus::Completed,
                        format!("Successfully processed {rows} rows"),
                    )
                    .await;
            }
            WorkMessage::JobRetrying {
                job_id,
                attempt,
                reason,
            } => {
                debug!(message = "Retrying job", job_id = ?job_id, attempt, error = ?reason);
                self.statuses
                    .update(
                        job_id,
                        JobStatus::Queued,
                        format!("Retry {attempt} scheduled after failure: {reason}"),
                    )
                    .await;
            }
            WorkMessage::JobFailed(job_id, error_msg) => {
                debug!(message = "Failed job", job_id = ?job_id, error = ?error_msg);
                self.statuses
                    .update(job_id, JobStatus::Failed, format!("Processing failed: {error_msg}"))
                    .await;
            }
        }
    }
}

/// Drains worker events into the store until cancelled or every sender is gone.
/// Events still buffered at cancellation are applied before returning.
pub async fn reconcile(
    cancel_token: CancellationToken,
    reconciler: Reconciler,
    mut recv_from_worker: mpsc::UnboundedReceiver<WorkMessage>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Reconciler Cancelled");
                break;
            },
            chan_msg = recv_from_worker.recv() => {
                match chan_msg {
                    None => {
                        debug!("Worker channel closed, exiting");
                        break;
                    },
                    Some(message) => reconciler.apply(message).await,
                }
            }
        }
    }

    while let Ok(message) = recv_from_worker.try_recv() {
        reconciler.apply(message).await;
    }
}

/// Everything a pool of workers shares.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<dyn JobQueue>,
    pub blobs: Arc<dyn BlobStore>,
    pub tables: Arc<dyn TableWriter>,
    pub statuses: JobStatusStore,
    pub config: WorkerConfig,
}

/// Runs `workers_count` queue consumers and the status reconciler until
/// `cancel_token` fires.
pub async fn serve(
    cancel_token: CancellationToken,
    deps: WorkerDeps,
    workers_count: u16,
) -> Result<(), Error> {
    let (send_to_server, recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();

    let mut workers = vec![];
    for id in 0..workers_count {
        let subscription = deps.queue.subscribe().await?;
        let worker = JobWorker::new(
            deps.queue.clone(),
            deps.blobs.clone(),
            deps.tables.clone(),
            deps.config.clone(),
            send_to_server.clone(),
        );
        let cancel_token = cancel_token.clone();
        let join_handle = tokio::spawn(
            async move {
                worker.start(cancel_token, subscription).await;
            }
            .instrument(info_span!("worker", id)),
        );
        workers.push(join_handle);
    }
    drop(send_to_server);
    info!(queue = deps.queue.name(), workers = workers_count, "Workers started");

    // The reconciler keeps running until the last worker has reported.
    let reconciler = tokio::spawn(
        reconcile(
            CancellationToken::new(),
            Reconciler::new(deps.statuses.clone()),
            recv_from_worker,
        )
        .instrument(info_span!("reconciler")),
    );

    // Wait for all workers to complete
    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;
    reconciler.await?;

    info!("Server stopped.");

    Ok(())
}
