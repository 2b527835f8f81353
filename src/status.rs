//! Job status store
//!
//! A TTL-bounded key/value view of every job, keyed `job:{jobId}`. Status is
//! observability only: backend failures are logged and never reach callers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::StatusConfig;
use crate::db::DbHandle;
use crate::{JobRecord, JobStatus, Result};

const JOB_PREFIX: &str = "job:";

/// Raw storage under the status store: string values with a per-key expiry.
#[async_trait]
pub trait StatusBackend: Send + Sync {
    /// Upsert `value` and restart its expiry.
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Drops every expired entry, returning how many went.
    async fn purge_expired(&self) -> Result<u64>;
}

#[derive(Clone)]
pub struct JobStatusStore {
    backend: Arc<dyn StatusBackend>,
    ttl: Duration,
}

impl JobStatusStore {
    pub fn new(backend: Arc<dyn StatusBackend>, config: &StatusConfig) -> Self {
        Self {
            backend,
            ttl: config.ttl,
        }
    }

    pub fn in_memory(config: &StatusConfig) -> Self {
        Self::new(Arc::new(MemoryStatusBackend::default()), config)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn key(job_id: Uuid) -> String {
        format!("{JOB_PREFIX}{job_id}")
    }

    pub async fn put(&self, record: &JobRecord) {
        let key = Self::key(record.job_id);
        let value = match serde_json::to_string(record) {
            Ok(value) => value,
            Err(err) => {
                error!(message = "Failed to encode job status", job_id = %record.job_id, error = %err);
                return;
            }
        };

        debug!(message = "Saving job status", key = %key, status = %record.status);
        if let Err(err) = self.backend.put(&key, value, self.ttl).await {
            error!(message = "Failed to save job status", job_id = %record.job_id, error = %err);
        }
    }

    pub async fn get(&self, job_id: Uuid) -> Option<JobRecord> {
        let key = Self::key(job_id);
        let value = match self.backend.get(&key).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!(message = "Job not found", job_id = %job_id);
                return None;
            }
            Err(err) => {
                error!(message = "Failed to get job status", job_id = %job_id, error = %err);
                return None;
            }
        };

        match serde_json::from_str(&value) {
            Ok(record) => Some(record),
            Err(err) => {
                error!(message = "Stored job status is unreadable", job_id = %job_id, error = %err);
                None
            }
        }
    }

    /// Read-modify-write of `status` and `message`. Refreshes the TTL.
    ///
    /// Returns the stored record, or `None` when the job is unknown (expired
    /// records included) or the transition would reopen a finished job.
    pub async fn update(
        &self,
        job_id: Uuid,
        status: JobStatus,
        message: impl Into<String>,
    ) -> Option<JobRecord> {
        let message = message.into();
        let Some(mut record) = self.get(job_id).await else {
            warn!(message = "Cannot update job status, job not found", job_id = %job_id, status = %status);
            return None;
        };

        if !record.status.can_transition_to(status) {
            warn!(
                message = "Ignoring status change of finished job",
                job_id = %job_id,
                from = %record.status,
                to = %status
            );
            return None;
        }

        info!(message = "Updating job status", job_id = %job_id, status = %status, detail = %message);
        record.status = status;
        record.message = message;
        self.put(&record).await;

        Some(record)
    }

    pub async fn delete(&self, job_id: Uuid) -> bool {
        match self.backend.delete(&Self::key(job_id)).await {
            Ok(true) => {
                info!(message = "Job status deleted", job_id = %job_id);
                true
            }
            Ok(false) => {
                warn!(message = "Job status not found or already deleted", job_id = %job_id);
                false
            }
            Err(err) => {
                error!(message = "Failed to delete job status", job_id = %job_id, error = %err);
                false
            }
        }
    }

    pub async fn exists(&self, job_id: Uuid) -> bool {
        self.backend
            .exists(&Self::key(job_id))
            .await
            .unwrap_or_else(|err| {
                error!(message = "Error checking job existence", job_id = %job_id, error = %err);
                false
            })
    }
}

/// Purges `backend` every `interval` until `cancel_token` fires.
pub fn spawn_purge(
    cancel_token: CancellationToken,
    backend: Arc<dyn StatusBackend>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = ticker.tick() => match backend.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, "Purged expired job statuses"),
                        Err(err) => warn!(error = %err, "Failed to purge expired job statuses"),
                    },
                }
            }
        }
        .instrument(info_span!("purge")),
    )
}

/// Process-local backend, measured against the tokio clock.
#[derive(Default)]
pub struct MemoryStatusBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStatusBackend {
    fn live<'a>(
        entries: &'a mut HashMap<String, (String, Instant)>,
        key: &str,
    ) -> Option<&'a String> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|(_, expires_at)| *expires_at <= now) {
            entries.remove(key);
        }
        entries.get(key).map(|(value, _)| value)
    }

    /// Entries held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl StatusBackend for MemoryStatusBackend {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let live = Self::live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(live)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        Ok(Self::live(&mut entries, key).is_some())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - entries.len()) as u64)
    }
}

pub struct PgStatusBackend {
    db: DbHandle,
}

impl PgStatusBackend {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StatusBackend for PgStatusBackend {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        sqlx::query(
            "INSERT INTO lakeq_job_status (key, value, expires_at) \
             VALUES ($1, $2::jsonb, now() + make_interval(secs => $3)) \
             ON CONFLICT (key) DO UPDATE \
                SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(sqlx::query_scalar::<_, String>(
            "SELECT value::text FROM lakeq_job_status WHERE key = $1 AND expires_at > now()",
        )
        .bind(key)
        .fetch_optional(self.db.pool())
        .await?)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let live = sqlx::query_scalar::<_, bool>(
            "DELETE FROM lakeq_job_status WHERE key = $1 RETURNING expires_at > now()",
        )
        .bind(key)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(live.unwrap_or(false))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM lakeq_job_status WHERE key = $1 AND expires_at > now())",
        )
        .bind(key)
        .fetch_one(self.db.pool())
        .await?)
    }

    /// Reads already ignore expired rows; this reclaims them.
    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM lakeq_job_status WHERE expires_at <= now()")
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
