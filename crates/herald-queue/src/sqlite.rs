use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};

use herald_common::{DispatchJob, QueuedJob};

use crate::{EmbeddedQueue, QueueConsumer, QueueError, QueueMetrics, QueuePublisher, Result};

/// SQLite-backed queue mimicking SQS visibility-timeout semantics for local
/// development and tests.
pub struct SqliteQueue {
    pool: Pool<Sqlite>,
    queue_name: String,
    visibility_timeout_seconds: u32,
    running: AtomicBool,
    total_polled: AtomicU64,
    total_acked: AtomicU64,
    total_nacked: AtomicU64,
    total_deferred: AtomicU64,
}

impl SqliteQueue {
    pub fn new(pool: Pool<Sqlite>, queue_name: String, visibility_timeout_seconds: u32) -> Self {
        Self {
            pool,
            queue_name,
            visibility_timeout_seconds,
            running: AtomicBool::new(true),
            total_polled: AtomicU64::new(0),
            total_acked: AtomicU64::new(0),
            total_nacked: AtomicU64::new(0),
            total_deferred: AtomicU64::new(0),
        }
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                receive_count INTEGER DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_visible
            ON queue_messages (queue_name, visible_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "SQLite queue schema initialized");
        Ok(())
    }

    fn generate_receipt_handle(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    async fn insert(&self, job: DispatchJob, delay_seconds: u32) -> Result<String> {
        let now = Utc::now().timestamp();
        let payload = serde_json::to_string(&job)?;
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO queue_messages (id, queue_name, visible_at, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&self.queue_name)
        .bind(now + delay_seconds as i64)
        .bind(&payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!(
            notification_id = %job.notification_id,
            queue = %self.queue_name,
            delay_seconds = delay_seconds,
            "Job published to SQLite queue"
        );

        Ok(id)
    }

    async fn release(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let delay = delay_seconds.unwrap_or(0) as i64;
        let new_visible_at = Utc::now().timestamp() + delay;

        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?, receipt_handle = NULL
            WHERE receipt_handle = ? AND queue_name = ?
            "#,
        )
        .bind(new_visible_at)
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                receipt_handle = %receipt_handle,
                queue = %self.queue_name,
                "Release failed - message not found"
            );
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }

        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for SqliteQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedJob>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let now = Utc::now().timestamp();
        let new_visible_at = now + self.visibility_timeout_seconds as i64;

        let rows = sqlx::query(
            r#"
            SELECT id, payload
            FROM queue_messages
            WHERE queue_name = ? AND visible_at <= ?
            ORDER BY created_at
            LIMIT ?
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());

        for row in rows {
            let id: String = row.get("id");
            let payload: String = row.get("payload");

            let receipt_handle = self.generate_receipt_handle();

            let updated = sqlx::query(
                r#"
                UPDATE queue_messages
                SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE id = ? AND queue_name = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(new_visible_at)
            .bind(&id)
            .bind(&self.queue_name)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 0 {
                // Another consumer grabbed this message
                continue;
            }

            let job: DispatchJob = serde_json::from_str(&payload)?;

            jobs.push(QueuedJob {
                job,
                receipt_handle,
                broker_message_id: Some(id),
                queue_identifier: self.queue_name.clone(),
            });
        }

        if !jobs.is_empty() {
            self.total_polled.fetch_add(jobs.len() as u64, Ordering::Relaxed);
            debug!(
                queue = %self.queue_name,
                count = jobs.len(),
                "Polled jobs from SQLite queue"
            );
        }

        Ok(jobs)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM queue_messages WHERE receipt_handle = ? AND queue_name = ?")
                .bind(receipt_handle)
                .bind(&self.queue_name)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            warn!(
                receipt_handle = %receipt_handle,
                queue = %self.queue_name,
                "ACK failed - message not found or already deleted"
            );
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }

        self.total_acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        self.release(receipt_handle, delay_seconds).await?;
        self.total_nacked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn defer(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        self.release(receipt_handle, delay_seconds).await?;
        self.total_deferred.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let new_visible_at = Utc::now().timestamp() + seconds as i64;

        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?
            WHERE receipt_handle = ? AND queue_name = ?
            "#,
        )
        .bind(new_visible_at)
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }

        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQLite queue consumer stopped");
    }

    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        let now = Utc::now().timestamp();

        let pending_row = sqlx::query(
            "SELECT COUNT(*) as count FROM queue_messages WHERE queue_name = ? AND visible_at <= ? AND receipt_handle IS NULL"
        )
        .bind(&self.queue_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let pending_messages: i64 = pending_row.get("count");

        let in_flight_row = sqlx::query(
            "SELECT COUNT(*) as count FROM queue_messages WHERE queue_name = ? AND receipt_handle IS NOT NULL"
        )
        .bind(&self.queue_name)
        .fetch_one(&self.pool)
        .await?;
        let in_flight_messages: i64 = in_flight_row.get("count");

        Ok(Some(QueueMetrics {
            pending_messages: pending_messages as u64,
            in_flight_messages: in_flight_messages as u64,
            queue_identifier: self.queue_name.clone(),
            total_polled: self.total_polled.load(Ordering::Relaxed),
            total_acked: self.total_acked.load(Ordering::Relaxed),
            total_nacked: self.total_nacked.load(Ordering::Relaxed),
            total_deferred: self.total_deferred.load(Ordering::Relaxed),
        }))
    }
}

#[async_trait]
impl QueuePublisher for SqliteQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn publish(&self, job: DispatchJob) -> Result<String> {
        self.insert(job, 0).await
    }

    async fn publish_delayed(&self, job: DispatchJob, delay_seconds: u32) -> Result<String> {
        self.insert(job, delay_seconds).await
    }
}

#[async_trait]
impl EmbeddedQueue for SqliteQueue {
    async fn init_schema(&self) -> Result<()> {
        self.create_schema().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use herald_common::Priority;
    use sqlx::sqlite::SqlitePoolOptions;
    use uuid::Uuid;

    async fn create_test_queue() -> SqliteQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let queue = SqliteQueue::new(pool, "herald-email".to_string(), 30);
        queue.init_schema().await.unwrap();
        queue
    }

    fn job() -> DispatchJob {
        DispatchJob {
            notification_id: Uuid::new_v4(),
            tenant_id: "acme".to_string(),
            priority: Priority::Normal,
            attempt_count: 0,
            enqueued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_and_poll() {
        let queue = create_test_queue().await;
        let job = job();
        let notification_id = job.notification_id;

        queue.publish(job).await.unwrap();

        let jobs = queue.poll(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job.notification_id, notification_id);

        queue.ack(&jobs[0].receipt_handle).await.unwrap();

        let jobs = queue.poll(10).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn polled_message_is_invisible_until_timeout() {
        let queue = create_test_queue().await;
        queue.publish(job()).await.unwrap();

        let first = queue.poll(10).await.unwrap();
        assert_eq!(first.len(), 1);

        // Still in flight; second poll sees nothing
        let second = queue.poll(10).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn nack_with_delay_hides_message() {
        let queue = create_test_queue().await;
        queue.publish(job()).await.unwrap();

        let jobs = queue.poll(10).await.unwrap();
        queue.nack(&jobs[0].receipt_handle, Some(60)).await.unwrap();

        let jobs = queue.poll(10).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn nack_without_delay_redelivers() {
        let queue = create_test_queue().await;
        queue.publish(job()).await.unwrap();

        let jobs = queue.poll(10).await.unwrap();
        queue.nack(&jobs[0].receipt_handle, None).await.unwrap();

        let jobs = queue.poll(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn publish_delayed_is_invisible() {
        let queue = create_test_queue().await;
        queue.publish_delayed(job(), 120).await.unwrap();

        let jobs = queue.poll(10).await.unwrap();
        assert!(jobs.is_empty());

        let metrics = queue.get_metrics().await.unwrap().unwrap();
        assert_eq!(metrics.pending_messages, 0);
    }

    #[tokio::test]
    async fn defer_does_not_count_as_nack() {
        let queue = create_test_queue().await;
        queue.publish(job()).await.unwrap();

        let jobs = queue.poll(10).await.unwrap();
        queue.defer(&jobs[0].receipt_handle, Some(5)).await.unwrap();

        let metrics = queue.get_metrics().await.unwrap().unwrap();
        assert_eq!(metrics.total_nacked, 0);
        assert_eq!(metrics.total_deferred, 1);
    }

    #[tokio::test]
    async fn metrics_track_pending_and_in_flight() {
        let queue = create_test_queue().await;
        queue.publish(job()).await.unwrap();
        queue.publish(job()).await.unwrap();

        let metrics = queue.get_metrics().await.unwrap().unwrap();
        assert_eq!(metrics.pending_messages, 2);
        assert_eq!(metrics.in_flight_messages, 0);

        queue.poll(1).await.unwrap();

        let metrics = queue.get_metrics().await.unwrap().unwrap();
        assert_eq!(metrics.pending_messages, 1);
        assert_eq!(metrics.in_flight_messages, 1);
    }
}
