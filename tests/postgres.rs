//! Runs against the server in `DATABASE_URL`, each test in a throwaway
//! database. Without `DATABASE_URL` every test returns early.

use chrono::Utc;
use lakeq::config::{QueueConfig, StatusConfig};
use lakeq::db::DbHandle;
use lakeq::queue::{Delivery, JobQueue, PgJobQueue, Subscription};
use lakeq::status::{JobStatusStore, PgStatusBackend, StatusBackend};
use lakeq::{Error, JobDescriptor, JobRecord, JobStatus};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct TestDatabase {
    source_pool: PgPool,
    db: DbHandle,
    name: String,
}

impl TestDatabase {
    async fn drop(&self) {
        self.db.close().await;
        sqlx::query(&format!("DROP DATABASE {} WITH (FORCE)", self.name))
            .execute(&self.source_pool)
            .await
            .expect("Failed to drop test database");
    }
}

async fn create_test_database(db_url: &str) -> TestDatabase {
    let options: PgConnectOptions = db_url.parse().expect("Failed to parse DATABASE_URL");
    let options = options.application_name("__test_lakeq");

    let source_pool = PgPoolOptions::new()
        .max_connections(2)
        .connect_with(options.clone())
        .await
        .expect("Failed to connect to database");

    let name = format!("__test_lakeq_{}", Uuid::new_v4().simple());
    sqlx::query(&format!("CREATE DATABASE {name}"))
        .execute(&source_pool)
        .await
        .expect("Failed to create test database");

    let db = DbHandle::connect_with(options.database(&name))
        .await
        .expect("Failed to set up test database");

    TestDatabase {
        source_pool,
        db,
        name,
    }
}

async fn with_test_db<F, Fut>(test_fn: F)
where
    F: FnOnce(DbHandle) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let Ok(db_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return;
    };

    let test_db = create_test_database(&db_url).await;
    let result = tokio::spawn(test_fn(test_db.db.clone())).await;
    test_db.drop().await;
    result.expect("Test failed");
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        name: "file.processing.queue".to_string(),
        poll_interval: Duration::from_millis(20),
        consumer_timeout: Duration::from_secs(2),
    }
}

fn descriptor() -> JobDescriptor {
    let job_id = Uuid::new_v4();
    JobDescriptor {
        job_id,
        file_path: format!("uploads/{job_id}/orders.csv"),
        file_name: "orders.csv".to_string(),
        table_name: "orders".to_string(),
        attempt: 0,
    }
}

async fn next_within(subscription: &mut Box<dyn Subscription>, wait: Duration) -> Option<Delivery> {
    tokio::time::timeout(wait, subscription.next())
        .await
        .ok()
        .map(|delivery| delivery.expect("Failed to claim"))
}

#[tokio::test]
async fn claims_are_exclusive() {
    with_test_db(|db| async move {
        let queue = PgJobQueue::declare(db, queue_config()).await.unwrap();
        let published: HashSet<Uuid> = {
            let mut ids = HashSet::new();
            for _ in 0..20 {
                let descriptor = descriptor();
                queue.publish(&descriptor).await.unwrap();
                ids.insert(descriptor.job_id);
            }
            ids
        };

        let mut consumers = vec![];
        for _ in 0..4 {
            let mut subscription = queue.subscribe().await.unwrap();
            consumers.push(tokio::spawn(async move {
                let mut held = vec![];
                for _ in 0..5 {
                    held.push(subscription.next().await.unwrap());
                }
                (subscription, held)
            }));
        }

        let mut claimed = HashSet::new();
        let mut deliveries = vec![];
        let mut subscriptions = vec![];
        for consumer in consumers {
            let (subscription, held) = tokio::time::timeout(Duration::from_secs(10), consumer)
                .await
                .expect("consumers starved")
                .unwrap();
            for delivery in held {
                assert_eq!(delivery.delivery_count(), 1);
                assert!(claimed.insert(delivery.descriptor().unwrap().job_id));
                deliveries.push(delivery);
            }
            subscriptions.push(subscription);
        }
        assert_eq!(claimed, published);

        let stats = queue.stats().await.unwrap().unwrap();
        assert_eq!(stats.depth, 0);
        assert_eq!(stats.consumer_count, 4);

        for delivery in deliveries {
            delivery.ack().await.unwrap();
        }
        let mut late = queue.subscribe().await.unwrap();
        assert!(next_within(&mut late, Duration::from_millis(200)).await.is_none());
    })
    .await;
}

#[tokio::test]
async fn dropped_consumer_hands_back_its_deliveries() {
    with_test_db(|db| async move {
        let queue = PgJobQueue::declare(db, queue_config()).await.unwrap();
        let published = descriptor();
        queue.publish(&published).await.unwrap();

        let mut first = queue.subscribe().await.unwrap();
        let mut second = queue.subscribe().await.unwrap();
        let held = first.next().await.unwrap();
        assert!(!held.redelivered());
        assert!(next_within(&mut second, Duration::from_millis(200)).await.is_none());

        drop(held);
        drop(first);

        let redelivered = next_within(&mut second, Duration::from_secs(5))
            .await
            .expect("message was not handed back");
        assert_eq!(redelivered.descriptor().unwrap(), published);
        assert_eq!(redelivered.delivery_count(), 2);
        assert!(redelivered.redelivered());
        redelivered.ack().await.unwrap();
    })
    .await;
}

#[tokio::test]
async fn dead_consumer_claims_are_released() {
    with_test_db(|db| async move {
        let queue = PgJobQueue::declare(db.clone(), queue_config()).await.unwrap();
        queue.publish(&descriptor()).await.unwrap();

        // A consumer that claimed the message and never heartbeated.
        sqlx::query("UPDATE lakeq_messages SET locked_by = 'gone', locked_at = now()")
            .execute(db.pool())
            .await
            .unwrap();
        assert_eq!(queue.stats().await.unwrap().unwrap().depth, 0);

        assert_eq!(queue.release_orphaned().await.unwrap(), 1);
        assert_eq!(queue.stats().await.unwrap().unwrap().depth, 1);
        assert_eq!(queue.release_orphaned().await.unwrap(), 0);
    })
    .await;
}

#[tokio::test]
async fn dead_letter_leaves_live_queue() {
    with_test_db(|db| async move {
        let queue = PgJobQueue::declare(db, queue_config()).await.unwrap();
        let published = descriptor();
        queue.publish(&published).await.unwrap();

        let mut subscription = queue.subscribe().await.unwrap();
        let delivery = subscription.next().await.unwrap();
        delivery
            .dead_letter("Unsupported file type: .pdf")
            .await
            .unwrap();

        assert_eq!(queue.stats().await.unwrap().unwrap().depth, 0);
        assert!(next_within(&mut subscription, Duration::from_millis(200)).await.is_none());

        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].queue_name, "file.processing.queue");
        assert_eq!(dead[0].reason, "Unsupported file type: .pdf");
        assert_eq!(dead[0].delivery_count, 1);
        assert!(dead[0].payload.contains(&published.job_id.to_string()));
    })
    .await;
}

#[tokio::test]
async fn requeued_message_is_redelivered() {
    with_test_db(|db| async move {
        let queue = PgJobQueue::declare(db, queue_config()).await.unwrap();
        queue.publish(&descriptor()).await.unwrap();

        let mut subscription = queue.subscribe().await.unwrap();
        let delivery = subscription.next().await.unwrap();
        let tag = delivery.tag();
        delivery.requeue().await.unwrap();
        assert_eq!(queue.stats().await.unwrap().unwrap().depth, 1);

        let again = subscription.next().await.unwrap();
        assert_eq!(again.tag(), tag);
        assert_eq!(again.delivery_count(), 2);
        again.ack().await.unwrap();
        assert_eq!(queue.stats().await.unwrap().unwrap().depth, 0);
    })
    .await;
}

#[tokio::test]
async fn settling_a_lost_claim_fails() {
    with_test_db(|db| async move {
        let queue = PgJobQueue::declare(db.clone(), queue_config()).await.unwrap();
        queue.publish(&descriptor()).await.unwrap();

        let mut subscription = queue.subscribe().await.unwrap();
        let delivery = subscription.next().await.unwrap();
        sqlx::query("UPDATE lakeq_messages SET locked_by = 'someone-else'")
            .execute(db.pool())
            .await
            .unwrap();

        let err = delivery.ack().await.unwrap_err();
        assert!(matches!(err, Error::Queue(_)));
        let rows: i64 = sqlx::query_scalar("SELECT count(*) FROM lakeq_messages")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    })
    .await;
}

fn record(job_id: Uuid) -> JobRecord {
    JobRecord {
        job_id,
        user_id: "alice".into(),
        file_name: "orders.csv".into(),
        file_path: format!("uploads/{job_id}/orders.csv"),
        table_name: "orders".into(),
        file_size: 42,
        timestamp: Utc::now(),
        status: JobStatus::Queued,
        message: "File received and queued".into(),
    }
}

#[tokio::test]
async fn status_records_expire_and_are_purged() {
    with_test_db(|db| async move {
        let backend = Arc::new(PgStatusBackend::new(db));
        let store = JobStatusStore::new(
            backend.clone(),
            &StatusConfig {
                ttl: Duration::from_secs(1),
            },
        );

        let expiring = record(Uuid::new_v4());
        store.put(&expiring).await;
        let updated = store
            .update(expiring.job_id, JobStatus::Processing, "Processing started")
            .await
            .unwrap();
        assert_eq!(store.get(expiring.job_id).await, Some(updated));
        assert!(store.exists(expiring.job_id).await);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(store.get(expiring.job_id).await.is_none());
        assert!(!store.exists(expiring.job_id).await);
        assert!(store
            .update(expiring.job_id, JobStatus::Completed, "done")
            .await
            .is_none());

        let fresh = record(Uuid::new_v4());
        store.put(&fresh).await;
        assert_eq!(backend.purge_expired().await.unwrap(), 1);
        assert_eq!(backend.purge_expired().await.unwrap(), 0);

        assert!(store.delete(fresh.job_id).await);
        assert!(!store.delete(fresh.job_id).await);
    })
    .await;
}
