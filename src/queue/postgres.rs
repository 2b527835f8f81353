use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Acknowledger, DeadLetter, Delivery, JobQueue, QueueStats, Subscription};
use crate::config::QueueConfig;
use crate::db::DbHandle;
use crate::{Error, JobDescriptor, Result};

/// Queue stored in PostgreSQL. Consumers claim rows with `FOR UPDATE SKIP
/// LOCKED`; a claim lives as long as its consumer keeps heartbeating.
#[derive(Clone)]
pub struct PgJobQueue {
    db: DbHandle,
    config: QueueConfig,
}

impl PgJobQueue {
    /// Creates the queue if it does not exist yet.
    pub async fn declare(db: DbHandle, config: QueueConfig) -> Result<Self> {
        sqlx::query("INSERT INTO lakeq_queues (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(&config.name)
            .execute(db.pool())
            .await?;

        info!(queue = %config.name, "Queue declared");
        Ok(Self { db, config })
    }

    /// Hands deliveries held by dead consumers back to the live queue.
    pub async fn release_orphaned(&self) -> Result<u64> {
        release_orphaned(self.db.pool(), &self.config).await
    }
}

async fn release_orphaned(pool: &PgPool, config: &QueueConfig) -> Result<u64> {
    let timeout = config.consumer_timeout.as_secs_f64();

    let released = sqlx::query(
        "UPDATE lakeq_messages AS m \
            SET locked_by = NULL, locked_at = NULL \
         WHERE m.queue_name = $1 \
           AND m.locked_by IS NOT NULL \
           AND NOT EXISTS ( \
                SELECT 1 FROM lakeq_consumers AS c \
                WHERE c.consumer_tag = m.locked_by \
                  AND c.heartbeat_at > now() - make_interval(secs => $2))",
    )
    .bind(&config.name)
    .bind(timeout)
    .execute(pool)
    .await?
    .rows_affected();

    sqlx::query(
        "DELETE FROM lakeq_consumers \
         WHERE queue_name = $1 AND heartbeat_at <= now() - make_interval(secs => $2)",
    )
    .bind(&config.name)
    .bind(timeout)
    .execute(pool)
    .await?;

    if released > 0 {
        info!(queue = %config.name, released, "Released deliveries of dead consumers");
    }
    Ok(released)
}

async fn heartbeat(pool: &PgPool, config: &QueueConfig, consumer_tag: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO lakeq_consumers (consumer_tag, queue_name) VALUES ($1, $2) \
         ON CONFLICT (consumer_tag) DO UPDATE SET heartbeat_at = now()",
    )
    .bind(consumer_tag)
    .bind(&config.name)
    .execute(pool)
    .await?;

    Ok(())
}

#[async_trait]
impl JobQueue for PgJobQueue {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn publish(&self, descriptor: &JobDescriptor) -> Result<()> {
        sqlx::query("INSERT INTO lakeq_messages (queue_name, payload) VALUES ($1, $2)")
            .bind(&self.config.name)
            .bind(Json(descriptor))
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::queue(format!("failed to publish job {}: {e}", descriptor.job_id)))?;

        debug!(queue = %self.config.name, job_id = %descriptor.job_id, "Published job");
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        let consumer_tag = format!("{}-{}", self.config.name, Uuid::new_v4());
        heartbeat(self.db.pool(), &self.config, &consumer_tag).await?;
        self.release_orphaned().await?;

        let heartbeat_task = {
            let db = self.db.clone();
            let config = self.config.clone();
            let consumer_tag = consumer_tag.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.consumer_timeout / 3);
                loop {
                    ticker.tick().await;
                    if let Err(err) = heartbeat(db.pool(), &config, &consumer_tag).await {
                        warn!(consumer = %consumer_tag, error = %err, "Heartbeat failed");
                    }
                    if let Err(err) = release_orphaned(db.pool(), &config).await {
                        warn!(consumer = %consumer_tag, error = %err, "Releasing orphaned deliveries failed");
                    }
                }
            })
        };

        debug!(consumer = %consumer_tag, "Consumer registered");
        Ok(Box::new(PgSubscription {
            acker: Arc::new(PgAcker {
                db: self.db.clone(),
                consumer_tag: consumer_tag.clone(),
            }),
            consumer_tag,
            db: self.db.clone(),
            config: self.config.clone(),
            heartbeat_task,
        }))
    }

    async fn stats(&self) -> Result<Option<QueueStats>> {
        let declared = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM lakeq_queues WHERE name = $1)",
        )
        .bind(&self.config.name)
        .fetch_one(self.db.pool())
        .await?;

        if !declared {
            return Ok(None);
        }

        let (depth, consumers) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT \
                (SELECT count(*) FROM lakeq_messages WHERE queue_name = $1 AND locked_by IS NULL), \
                (SELECT count(*) FROM lakeq_consumers \
                    WHERE queue_name = $1 AND heartbeat_at > now() - make_interval(secs => $2))",
        )
        .bind(&self.config.name)
        .bind(self.config.consumer_timeout.as_secs_f64())
        .fetch_one(self.db.pool())
        .await?;

        Ok(Some(QueueStats {
            depth: depth.max(0) as u64,
            consumer_count: consumers.max(0) as u64,
        }))
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, (String, String, String, i32, DateTime<Utc>)>(
            "SELECT queue_name, payload::text, reason, delivery_count, dead_at \
             FROM lakeq_dead_letters WHERE queue_name = $1 \
             ORDER BY id DESC LIMIT $2",
        )
        .bind(&self.config.name)
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(queue_name, payload, reason, delivery_count, dead_at)| DeadLetter {
                    queue_name,
                    payload,
                    reason,
                    delivery_count: delivery_count.max(0) as u32,
                    dead_at,
                },
            )
            .collect())
    }
}

struct PgSubscription {
    consumer_tag: String,
    db: DbHandle,
    config: QueueConfig,
    acker: Arc<PgAcker>,
    heartbeat_task: JoinHandle<()>,
}

impl PgSubscription {
    async fn claim(&self) -> Result<Option<(i64, String, i32)>> {
        Ok(sqlx::query_as::<_, (i64, String, i32)>(
            "UPDATE lakeq_messages \
                SET locked_by = $2, locked_at = now(), delivery_count = delivery_count + 1 \
             WHERE id = ( \
                SELECT id FROM lakeq_messages \
                WHERE queue_name = $1 AND locked_by IS NULL \
                ORDER BY id \
                LIMIT 1 \
                FOR UPDATE SKIP LOCKED) \
             RETURNING id, payload::text, delivery_count",
        )
        .bind(&self.config.name)
        .bind(&self.consumer_tag)
        .fetch_optional(self.db.pool())
        .await?)
    }
}

#[async_trait]
impl Subscription for PgSubscription {
    fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    async fn next(&mut self) -> Result<Delivery> {
        loop {
            if let Some((id, payload, delivery_count)) = self.claim().await? {
                return Ok(Delivery::new(
                    id,
                    payload.into_bytes(),
                    delivery_count.max(0) as u32,
                    self.acker.clone(),
                ));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

impl Drop for PgSubscription {
    fn drop(&mut self) {
        self.heartbeat_task.abort();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let db = self.db.clone();
        let consumer_tag = self.consumer_tag.clone();
        runtime.spawn(async move {
            let released = sqlx::query(
                "UPDATE lakeq_messages SET locked_by = NULL, locked_at = NULL WHERE locked_by = $1",
            )
            .bind(&consumer_tag)
            .execute(db.pool())
            .await;
            let removed = sqlx::query("DELETE FROM lakeq_consumers WHERE consumer_tag = $1")
                .bind(&consumer_tag)
                .execute(db.pool())
                .await;

            match (released, removed) {
                (Ok(released), Ok(_)) => debug!(
                    consumer = %consumer_tag,
                    released = released.rows_affected(),
                    "Consumer deregistered"
                ),
                (Err(err), _) | (_, Err(err)) => warn!(
                    consumer = %consumer_tag,
                    error = %err,
                    "Consumer cleanup failed, its deliveries return after the heartbeat timeout"
                ),
            }
        });
    }
}

struct PgAcker {
    db: DbHandle,
    consumer_tag: String,
}

impl PgAcker {
    fn lost(&self, tag: i64) -> Error {
        Error::queue(format!(
            "delivery {tag} is no longer held by {}",
            self.consumer_tag
        ))
    }
}

#[async_trait]
impl Acknowledger for PgAcker {
    async fn ack(&self, tag: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM lakeq_messages WHERE id = $1 AND locked_by = $2")
            .bind(tag)
            .bind(&self.consumer_tag)
            .execute(self.db.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(self.lost(tag));
        }
        Ok(())
    }

    async fn requeue(&self, tag: i64) -> Result<()> {
        let result = sqlx::query(
            "UPDATE lakeq_messages SET locked_by = NULL, locked_at = NULL \
             WHERE id = $1 AND locked_by = $2",
        )
        .bind(tag)
        .bind(&self.consumer_tag)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lost(tag));
        }
        Ok(())
    }

    async fn dead_letter(&self, tag: i64, reason: &str) -> Result<()> {
        let result = sqlx::query(
            "WITH m AS ( \
                DELETE FROM lakeq_messages WHERE id = $1 AND locked_by = $2 \
                RETURNING queue_name, payload, delivery_count) \
             INSERT INTO lakeq_dead_letters (queue_name, payload, reason, delivery_count) \
             SELECT queue_name, payload, $3, delivery_count FROM m",
        )
        .bind(tag)
        .bind(&self.consumer_tag)
        .bind(reason)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lost(tag));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PgJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgJobQueue")
            .field("name", &self.config.name)
            .finish()
    }
}

