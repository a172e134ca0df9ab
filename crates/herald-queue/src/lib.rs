use async_trait::async_trait;
use herald_common::{DispatchJob, QueuedJob};

pub mod error;
pub mod sqlite;
pub mod sqs;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Queue metrics for monitoring.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    /// Approximate number of messages visible in the queue (pending).
    pub pending_messages: u64,
    /// Approximate number of messages currently in flight.
    pub in_flight_messages: u64,
    pub queue_identifier: String,
    pub total_polled: u64,
    pub total_acked: u64,
    pub total_nacked: u64,
    /// Messages released for redelivery without counting as failures
    /// (rate limiting, backpressure).
    pub total_deferred: u64,
}

/// Trait for consuming dispatch jobs from a queue.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    fn identifier(&self) -> &str;

    /// Long-poll receive up to `max_messages` jobs.
    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedJob>>;

    /// Acknowledge a job (remove from queue).
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Negative acknowledge (make visible again after delay). Counted as a
    /// failure in metrics.
    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()>;

    /// Release a job for redelivery without counting it as a failure. Used
    /// when the local rate limiter denies processing.
    async fn defer(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        self.nack(receipt_handle, delay_seconds).await
    }

    /// Extend the visibility timeout for an in-flight job.
    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()>;

    fn is_healthy(&self) -> bool;

    async fn stop(&self);

    /// Queue depth metrics; `None` when the backend cannot report them.
    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        Ok(None)
    }
}

/// Trait for publishing dispatch jobs to a queue.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    fn identifier(&self) -> &str;

    async fn publish(&self, job: DispatchJob) -> Result<String>;

    /// Publish with an initial visibility delay (retry scheduling).
    async fn publish_delayed(&self, job: DispatchJob, delay_seconds: u32) -> Result<String>;

    async fn publish_batch(&self, jobs: Vec<DispatchJob>) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(self.publish(job).await?);
        }
        Ok(ids)
    }
}

/// Combined consumer and publisher for embedded/dev mode.
#[async_trait]
pub trait EmbeddedQueue: QueueConsumer + QueuePublisher {
    /// Initialize the queue schema (create tables, etc.).
    async fn init_schema(&self) -> Result<()>;
}
