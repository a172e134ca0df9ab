//! Per-channel dispatch worker pools.
//!
//! Each pool long-polls one queue in batches, fans the batch out across
//! bounded concurrent task slots, and settles every message according to the
//! pipeline outcome: ack on completion, defer on local rate limiting, nack on
//! infrastructure errors. Shutdown is cooperative: in-flight tasks finish,
//! unacked messages redeliver after the visibility timeout.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use herald_common::{Channel, QueuedJob};
use herald_queue::QueueConsumer;
use serde::Serialize;

use crate::metrics::DispatchMetricsCollector;
use crate::pipeline::{Dispatcher, ProcessOutcome};

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub channel: String,
    pub queue: String,
    pub concurrency: u32,
    pub active_tasks: u32,
    pub metrics: crate::metrics::DispatchMetricsSnapshot,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: u32,
    pub batch_size: u32,
    /// Visibility delay used when deferring rate-limited messages.
    pub rate_limit_backoff: Duration,
    /// Nack delay for infrastructure errors.
    pub error_redelivery_delay: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            batch_size: 10,
            rate_limit_backoff: Duration::from_secs(5),
            error_redelivery_delay: Duration::from_secs(5),
        }
    }
}

pub struct WorkerPool {
    channel: Channel,
    consumer: Arc<dyn QueueConsumer>,
    dispatcher: Arc<Dispatcher>,
    settings: WorkerSettings,
    semaphore: Arc<Semaphore>,
    running: AtomicBool,
    active_tasks: Arc<AtomicU32>,
    /// Epoch second of the last rate-limit denial, for the poll backoff.
    last_rate_limited: Arc<AtomicI64>,
    metrics: Arc<DispatchMetricsCollector>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerPool {
    pub fn new(
        channel: Channel,
        consumer: Arc<dyn QueueConsumer>,
        dispatcher: Arc<Dispatcher>,
        settings: WorkerSettings,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let concurrency = settings.concurrency.max(1);
        Self {
            channel,
            consumer,
            dispatcher,
            settings,
            semaphore: Arc::new(Semaphore::new(concurrency as usize)),
            running: AtomicBool::new(true),
            active_tasks: Arc::new(AtomicU32::new(0)),
            last_rate_limited: Arc::new(AtomicI64::new(0)),
            metrics: Arc::new(DispatchMetricsCollector::new()),
            shutdown_tx,
        }
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            channel: self.channel.as_str().to_string(),
            queue: self.consumer.identifier().to_string(),
            concurrency: self.settings.concurrency,
            active_tasks: self.active_tasks.load(Ordering::SeqCst),
            metrics: self.metrics.snapshot(),
        }
    }

    pub fn metrics(&self) -> Arc<DispatchMetricsCollector> {
        self.metrics.clone()
    }

    /// Main poll loop. Runs until shutdown, then waits for in-flight tasks.
    pub async fn run(self: Arc<Self>) {
        info!(
            channel = %self.channel,
            queue = %self.consumer.identifier(),
            concurrency = self.settings.concurrency,
            "Dispatch worker pool started"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            // Back off the poll loop after a rate-limit denial instead of
            // re-dequeuing the same saturated tenant in a tight loop
            let last_limited = self.last_rate_limited.load(Ordering::SeqCst);
            if last_limited > 0 {
                let since = chrono::Utc::now().timestamp() - last_limited;
                let backoff = self.settings.rate_limit_backoff.as_secs() as i64;
                if since < backoff {
                    let wait = Duration::from_secs((backoff - since) as u64);
                    debug!(channel = %self.channel, wait_secs = wait.as_secs(), "Rate-limit poll backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown_rx.recv() => { self.running.store(false, Ordering::SeqCst); break; }
                    }
                } else {
                    self.last_rate_limited.store(0, Ordering::SeqCst);
                }
            }

            let batch = tokio::select! {
                polled = self.consumer.poll(self.settings.batch_size) => polled,
                _ = shutdown_rx.recv() => {
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
            };

            let jobs = match batch {
                Ok(jobs) => jobs,
                Err(herald_queue::QueueError::Stopped) => break,
                Err(e) => {
                    error!(channel = %self.channel, error = %e, "Queue poll failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if let Ok(Some(queue_metrics)) = self.consumer.get_metrics().await {
                metrics::gauge!("herald.queue.depth", "queue" => queue_metrics.queue_identifier)
                    .set(queue_metrics.pending_messages as f64);
            }

            for job in jobs {
                let permit = match self.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                let pool = Arc::clone(&self);
                tokio::spawn(async move {
                    pool.active_tasks.fetch_add(1, Ordering::SeqCst);
                    pool.handle(job).await;
                    pool.active_tasks.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                });
            }
        }

        self.drain().await;
        info!(channel = %self.channel, "Dispatch worker pool exited");
    }

    /// Process one job and settle the queue message by outcome.
    async fn handle(&self, queued: QueuedJob) {
        let started = Instant::now();
        let receipt = queued.receipt_handle.clone();
        let outcome = self.dispatcher.process(&queued.job).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(ProcessOutcome::Delivered) => {
                self.metrics.record_delivered(elapsed_ms);
                self.ack(&receipt).await;
            }
            Ok(ProcessOutcome::Dropped) => {
                self.ack(&receipt).await;
            }
            Ok(ProcessOutcome::Retried { delay_secs }) => {
                self.metrics.record_retried();
                debug!(
                    notification_id = %queued.job.notification_id,
                    delay_secs = delay_secs,
                    "Handed to retry queue"
                );
                self.ack(&receipt).await;
            }
            Ok(ProcessOutcome::FailedTerminal) => {
                self.metrics.record_failed(elapsed_ms);
                self.ack(&receipt).await;
            }
            Ok(ProcessOutcome::RateLimited { retry_after_secs }) => {
                self.metrics.record_rate_limited();
                self.last_rate_limited
                    .store(chrono::Utc::now().timestamp(), Ordering::SeqCst);
                // Release for redelivery; deferring is not a failure
                let delay = retry_after_secs.min(self.settings.rate_limit_backoff.as_secs().max(1))
                    as u32;
                if let Err(e) = self.consumer.defer(&receipt, Some(delay.max(1))).await {
                    warn!(error = %e, "Failed to defer rate-limited message");
                }
            }
            Err(e) => {
                warn!(
                    notification_id = %queued.job.notification_id,
                    error = %e,
                    "Dispatch failed on infrastructure error, nacking"
                );
                let delay = self.settings.error_redelivery_delay.as_secs() as u32;
                if let Err(e) = self.consumer.nack(&receipt, Some(delay)).await {
                    warn!(error = %e, "Failed to nack message");
                }
            }
        }
    }

    async fn ack(&self, receipt_handle: &str) {
        if let Err(e) = self.consumer.ack(receipt_handle).await {
            // The message redelivers and the processable check drops it
            warn!(error = %e, "Failed to ack message");
        }
    }

    /// Wait for in-flight tasks by draining every permit.
    async fn drain(&self) {
        let total = self.settings.concurrency.max(1);
        let mut held = Vec::with_capacity(total as usize);
        for _ in 0..total {
            match self.semaphore.acquire().await {
                Ok(permit) => held.push(permit),
                Err(_) => break,
            }
        }
        debug!(channel = %self.channel, "All dispatch slots drained");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
