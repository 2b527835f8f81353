//! Upload intake: store the bytes, record the job, enqueue it

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::blob::{upload_path, BlobStore, ByteStream};
use crate::config::SubmissionConfig;
use crate::queue::JobQueue;
use crate::status::JobStatusStore;
use crate::{is_valid_table_name, Error, JobRecord, JobStatus, Result};

pub const QUEUED_MESSAGE: &str = "File received and queued";

/// A file as received from a client.
pub struct Upload {
    pub body: ByteStream,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub user_id: Option<String>,
    pub table_name: Option<String>,
}

impl std::fmt::Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upload")
            .field("file_name", &self.file_name)
            .field("file_size", &self.file_size)
            .field("content_type", &self.content_type)
            .field("user_id", &self.user_id)
            .field("table_name", &self.table_name)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Clone)]
pub struct JobSubmissionService {
    blobs: Arc<dyn BlobStore>,
    statuses: JobStatusStore,
    queue: Arc<dyn JobQueue>,
    config: SubmissionConfig,
}

impl JobSubmissionService {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        statuses: JobStatusStore,
        queue: Arc<dyn JobQueue>,
        config: SubmissionConfig,
    ) -> Self {
        Self {
            blobs,
            statuses,
            queue,
            config,
        }
    }

    /// Blank optional fields fall back to the configured defaults.
    fn validate(&self, upload: &Upload) -> Result<(String, String)> {
        if upload.file_name.trim().is_empty() {
            return Err(Error::InvalidInput("No file uploaded".into()));
        }
        if upload.file_size == 0 {
            return Err(Error::InvalidInput(format!(
                "{} is empty",
                upload.file_name.trim()
            )));
        }

        let table_name = match upload.table_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.config.default_table.clone(),
        };
        if !is_valid_table_name(&table_name) {
            return Err(Error::InvalidInput(format!(
                "invalid table name {table_name:?}: use letters, digits and underscores"
            )));
        }

        let user_id = match upload.user_id.as_deref().map(str::trim) {
            Some(user) if !user.is_empty() => user.to_string(),
            _ => self.config.anonymous_user.clone(),
        };

        Ok((user_id, table_name))
    }

    #[instrument(skip(self, upload), fields(file_name = %upload.file_name, size = upload.file_size))]
    pub async fn submit(&self, upload: Upload) -> Result<Accepted> {
        let (user_id, table_name) = self.validate(&upload)?;

        let job_id = Uuid::new_v4();
        let file_name = upload.file_name.trim().to_string();
        let file_path = upload_path(job_id, &file_name);

        self.blobs
            .put(&file_path, upload.body, upload.file_size, &upload.content_type)
            .await?;

        let record = JobRecord {
            job_id,
            user_id,
            file_name,
            file_path,
            table_name,
            file_size: upload.file_size,
            timestamp: Utc::now(),
            status: JobStatus::Queued,
            message: QUEUED_MESSAGE.to_string(),
        };
        self.statuses.put(&record).await;

        if let Err(err) = self.queue.publish(&record.descriptor()).await {
            error!(message = "Failed to enqueue job", job_id = %job_id, error = %err);
            self.statuses
                .update(job_id, JobStatus::Failed, format!("Failed to enqueue job: {err}"))
                .await;
            return Err(err);
        }

        info!(
            message = "Job queued",
            job_id = %job_id,
            queue = self.queue.name(),
            table = %record.table_name
        );
        Ok(Accepted {
            job_id,
            status: JobStatus::Queued,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{stream_from_bytes, MemoryBlobStore};
    use crate::config::StatusConfig;
    use crate::queue::{DeadLetter, MemoryQueue, QueueStats, Subscription};
    use crate::JobDescriptor;
    use async_trait::async_trait;

    struct FailingBlobs;

    #[async_trait]
    impl BlobStore for FailingBlobs {
        async fn put(&self, path: &str, _: ByteStream, _: u64, _: &str) -> Result<()> {
            Err(Error::blob(format!("bucket unavailable for {path}")))
        }
        async fn get(&self, path: &str) -> Result<ByteStream> {
            Err(Error::BlobNotFound(path.to_string()))
        }
    }

    struct FailingQueue;

    #[async_trait]
    impl JobQueue for FailingQueue {
        fn name(&self) -> &str {
            "broken"
        }
        async fn publish(&self, _: &JobDescriptor) -> Result<()> {
            Err(Error::queue("connection reset"))
        }
        async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
            Err(Error::queue("connection reset"))
        }
        async fn stats(&self) -> Result<Option<QueueStats>> {
            Err(Error::queue("connection reset"))
        }
        async fn dead_letters(&self, _: usize) -> Result<Vec<DeadLetter>> {
            Ok(vec![])
        }
    }

    struct Fixture {
        service: JobSubmissionService,
        blobs: Arc<MemoryBlobStore>,
        statuses: JobStatusStore,
        queue: MemoryQueue,
    }

    fn fixture() -> Fixture {
        let blobs = Arc::new(MemoryBlobStore::default());
        let statuses = JobStatusStore::in_memory(&StatusConfig::default());
        let queue = MemoryQueue::new("file.processing.queue");
        let service = JobSubmissionService::new(
            blobs.clone(),
            statuses.clone(),
            Arc::new(queue.clone()),
            SubmissionConfig::default(),
        );
        Fixture {
            service,
            blobs,
            statuses,
            queue,
        }
    }

    fn upload(name: &str, content: &'static str) -> Upload {
        Upload {
            body: stream_from_bytes(content),
            file_name: name.to_string(),
            file_size: content.len() as u64,
            content_type: "text/csv".to_string(),
            user_id: None,
            table_name: None,
        }
    }

    async fn depth(queue: &MemoryQueue) -> u64 {
        queue.stats().await.unwrap().unwrap().depth
    }

    #[tokio::test]
    async fn accepted_upload_is_stored_recorded_and_queued() {
        let fx = fixture();
        let mut request = upload("orders.csv", "id,total\n1,10\n");
        request.user_id = Some("alice".into());
        request.table_name = Some("orders".into());

        let accepted = fx.service.submit(request).await.unwrap();
        assert_eq!(accepted.status, JobStatus::Queued);

        let record = fx.statuses.get(accepted.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.message, QUEUED_MESSAGE);
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.table_name, "orders");
        assert_eq!(record.file_size, 14);
        assert_eq!(
            record.file_path,
            format!("uploads/{}/orders.csv", accepted.job_id)
        );

        let blob = fx.blobs.object(&record.file_path).unwrap();
        assert_eq!(&blob.data[..], b"id,total\n1,10\n");
        assert_eq!(blob.content_type, "text/csv");

        assert_eq!(depth(&fx.queue).await, 1);
        let mut consumer = fx.queue.subscribe().await.unwrap();
        let descriptor = consumer.next().await.unwrap().descriptor().unwrap();
        assert_eq!(descriptor, record.descriptor());
    }

    #[tokio::test]
    async fn missing_fields_use_defaults() {
        let fx = fixture();
        let mut request = upload("data.csv", "a\n1\n");
        request.user_id = Some("   ".into());
        request.table_name = Some("".into());

        let accepted = fx.service.submit(request).await.unwrap();
        let record = fx.statuses.get(accepted.job_id).await.unwrap();
        assert_eq!(record.user_id, "anonymous");
        assert_eq!(record.table_name, "default_table");
    }

    #[tokio::test]
    async fn invalid_uploads_have_no_side_effects() {
        let fx = fixture();

        let mut empty = upload("orders.csv", "");
        empty.file_size = 0;
        let unnamed = upload("  ", "a\n1\n");
        let mut bad_table = upload("orders.csv", "a\n1\n");
        bad_table.table_name = Some("orders; drop".into());

        for request in [empty, unnamed, bad_table] {
            let err = fx.service.submit(request).await.unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{err}");
        }

        assert!(fx.blobs.is_empty());
        assert_eq!(depth(&fx.queue).await, 0);
    }

    #[tokio::test]
    async fn blob_failure_aborts_before_queueing() {
        let fx = fixture();
        let service = JobSubmissionService::new(
            Arc::new(FailingBlobs),
            fx.statuses.clone(),
            Arc::new(fx.queue.clone()),
            SubmissionConfig::default(),
        );

        let err = service.submit(upload("orders.csv", "a\n1\n")).await.unwrap_err();
        assert!(matches!(err, Error::Blob(_)));
        assert_eq!(depth(&fx.queue).await, 0);
    }

    #[tokio::test]
    async fn publish_failure_is_surfaced_and_recorded() {
        let blobs = Arc::new(MemoryBlobStore::default());
        let statuses = JobStatusStore::in_memory(&StatusConfig::default());
        let service = JobSubmissionService::new(
            blobs.clone(),
            statuses.clone(),
            Arc::new(FailingQueue),
            SubmissionConfig::default(),
        );

        let err = service.submit(upload("orders.csv", "a\n1\n")).await.unwrap_err();
        assert!(matches!(err, Error::Queue(_)));

        // The blob stays behind and the record tells pollers what happened.
        assert_eq!(blobs.len(), 1);
        let path = blobs_path(&blobs);
        let job_id: Uuid = path.split('/').nth(1).unwrap().parse().unwrap();
        let record = statuses.get(job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.message.contains("connection reset"));
    }

    fn blobs_path(blobs: &MemoryBlobStore) -> String {
        blobs.paths().into_iter().next().unwrap()
    }
}
