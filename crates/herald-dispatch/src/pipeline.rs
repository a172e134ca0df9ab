//! The per-message delivery state machine.
//!
//! One `process` call drives a queued notification through: load, rate gate,
//! claim, render, vendor select, breaker gate, deliver, record attempt, and
//! the retry-or-terminal decision. The returned outcome tells the worker how
//! to settle the queue message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use herald_common::{
    DeliveryAttempt, DispatchError, DispatchJob, Notification, NotificationStatus, OpKind,
    TEMPLATE_VENDOR,
};
use herald_coord::{BreakerKey, CircuitBreaker, RateDecision, RateLimiter};
use herald_store::NotificationStore;
use herald_template::TemplateService;
use herald_vendor::{SendRequest, VendorRegistry};

use crate::health_monitor::VendorSuccessTracker;
use crate::retry::RetryScheduler;
use crate::selector::VendorSelector;

/// How the worker should settle the queue message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Delivered; ack.
    Delivered,
    /// Not processable (unknown, already terminal); ack and drop.
    Dropped,
    /// Local rate limiter denied; release for redelivery, do not ack.
    RateLimited { retry_after_secs: u64 },
    /// Handed to the retry scheduler; ack (the retry queue carries it now).
    Retried { delay_secs: u64 },
    /// Terminal failure recorded; ack.
    FailedTerminal,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_attempts: i32,
    pub max_e2e_latency: Duration,
    pub default_vendor_timeout: Duration,
    /// Per-vendor call budgets (`vendors.<v>.timeout_ms`).
    pub vendor_timeouts: HashMap<String, Duration>,
    pub vendor_failover: bool,
    pub rate_limiting: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_e2e_latency: Duration::from_secs(30),
            default_vendor_timeout: Duration::from_secs(5),
            vendor_timeouts: HashMap::new(),
            vendor_failover: true,
            rate_limiting: true,
        }
    }
}

impl DispatchSettings {
    fn vendor_timeout(&self, vendor: &str) -> Duration {
        self.vendor_timeouts
            .get(vendor)
            .copied()
            .unwrap_or(self.default_vendor_timeout)
    }
}

pub struct DispatcherDeps {
    pub store: Arc<dyn NotificationStore>,
    pub templates: Arc<TemplateService>,
    pub registry: Arc<VendorRegistry>,
    pub selector: Arc<VendorSelector>,
    pub breaker: Arc<dyn CircuitBreaker>,
    pub limiter: Arc<dyn RateLimiter>,
    pub retry: Arc<RetryScheduler>,
    pub tracker: Arc<VendorSuccessTracker>,
}

pub struct Dispatcher {
    deps: DispatcherDeps,
    settings: DispatchSettings,
}

fn internal(e: impl std::fmt::Display) -> DispatchError {
    DispatchError::Internal(e.to_string())
}

impl Dispatcher {
    pub fn new(deps: DispatcherDeps, settings: DispatchSettings) -> Self {
        Self { deps, settings }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Drive one queued notification. `Err` means infrastructure trouble
    /// (store or coordination store unreachable); the worker nacks so the
    /// message redelivers.
    pub async fn process(&self, job: &DispatchJob) -> Result<ProcessOutcome, DispatchError> {
        let started = Instant::now();

        // 1. Load
        let Some(notification) = self
            .deps
            .store
            .get(job.notification_id)
            .await
            .map_err(internal)?
        else {
            warn!(notification_id = %job.notification_id, "Queued notification not found, dropping");
            return Ok(ProcessOutcome::Dropped);
        };

        if !notification.is_processable(self.settings.max_attempts) {
            debug!(
                notification_id = %notification.id,
                status = %notification.status,
                attempt_count = notification.attempt_count,
                "Notification not processable, dropping"
            );
            return Ok(ProcessOutcome::Dropped);
        }

        // 2. Rate-limit gate
        if self.settings.rate_limiting {
            let decision = self
                .deps
                .limiter
                .check(OpKind::Notification, &notification.tenant_id)
                .await
                .map_err(internal)?;
            if let RateDecision::Limited { retry_after_secs } = decision {
                return Ok(ProcessOutcome::RateLimited { retry_after_secs });
            }
        }

        // 3. Claim under the row lock
        let Some(notification) = self
            .deps
            .store
            .mark_processing(notification.id)
            .await
            .map_err(internal)?
        else {
            return Ok(ProcessOutcome::Dropped);
        };

        let deadline = job.enqueued_at
            + chrono::Duration::from_std(self.settings.max_e2e_latency)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        // 4. Render
        let (payload, vendor_metadata) = match self.render(&notification).await {
            Ok(rendered) => rendered,
            Err(e) if matches!(
                e,
                DispatchError::TemplateNotFound(_) | DispatchError::TemplateInvalid(_)
            ) =>
            {
                return self.fail_on_render(&notification, e, started).await;
            }
            Err(e) => return Err(e),
        };

        info!(
            event = "notification.rendered",
            notification_id = %notification.id,
            template_id = %notification.template_id,
            channel = %notification.channel,
            "Notification rendered"
        );

        // 5. Select vendor, gated by the breaker. Previously attempted
        // vendors are excluded, except when their failure was a vendor-side
        // rate limit (those retry on the same vendor after its hint).
        let attempts = self
            .deps
            .store
            .get_attempts(notification.id)
            .await
            .map_err(internal)?;
        let mut previously_attempted: Vec<String> = Vec::new();
        let mut excluded: Vec<String> = Vec::new();
        for attempt in &attempts {
            if attempt.vendor == TEMPLATE_VENDOR {
                continue;
            }
            if !previously_attempted.contains(&attempt.vendor) {
                previously_attempted.push(attempt.vendor.clone());
            }
            let vendor_rate_limited = attempt
                .response
                .get("error_code")
                .and_then(|v| v.as_str())
                == Some("vendor_rate_limited");
            if !vendor_rate_limited && !excluded.contains(&attempt.vendor) {
                excluded.push(attempt.vendor.clone());
            }
        }

        let mut breaker_rejected = false;
        let selection_started = Instant::now();
        let candidate = loop {
            let next = self
                .deps
                .selector
                .next(
                    notification.channel,
                    &notification.tenant_id,
                    &excluded,
                    notification.vendor_preference.as_deref(),
                )
                .await;

            let Some(vendor) = next else {
                return self
                    .no_vendor_outcome(&notification, breaker_rejected, &previously_attempted)
                    .await;
            };

            let key = BreakerKey::new(&notification.tenant_id, notification.channel, &vendor);
            if self.deps.breaker.is_available(&key).await.map_err(internal)? {
                break vendor;
            }

            breaker_rejected = true;
            if !self.settings.vendor_failover {
                // Failover disabled: the primary is gated, so the message
                // waits for its breaker rather than rotating
                return self
                    .no_vendor_outcome(&notification, true, &previously_attempted)
                    .await;
            }

            info!(
                event = "vendor.failover",
                notification_id = %notification.id,
                channel = %notification.channel,
                vendor = %vendor,
                reason = "circuit_open",
                "Vendor circuit open, re-selecting"
            );
            metrics::counter!("herald.vendor.failover", "vendor" => vendor.clone()).increment(1);
            excluded.push(vendor);
        };

        if breaker_rejected {
            // Re-selection plus breaker checks carry a 200ms budget so
            // end-to-end failover stays under 2s
            metrics::histogram!("herald.vendor.failover_latency_ms")
                .record(selection_started.elapsed().as_millis() as f64);
        }

        let breaker_key =
            BreakerKey::new(&notification.tenant_id, notification.channel, &candidate);

        // 6. Deliver under min(message deadline, vendor budget)
        let adapter = self.deps.registry.get(&candidate).ok_or_else(|| {
            DispatchError::Internal(format!("Configured vendor has no adapter: {candidate}"))
        })?;

        let remaining = (deadline - chrono::Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let call_budget = remaining.min(self.settings.vendor_timeout(&candidate));

        let request = SendRequest {
            notification_id: notification.id,
            tenant_id: notification.tenant_id.clone(),
            recipient: notification.recipient.clone(),
            payload,
            vendor_metadata,
        };

        let call_started = Instant::now();
        let result = if call_budget.is_zero() {
            Err(DispatchError::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            })
        } else {
            match tokio::time::timeout(call_budget, adapter.send(&request)).await {
                Ok(send_result) => send_result,
                // Dropping the future aborts the in-flight call
                Err(_) => Err(DispatchError::Timeout {
                    elapsed_ms: call_started.elapsed().as_millis() as u64,
                }),
            }
        };
        let duration_ms = call_started.elapsed().as_millis() as u64;
        metrics::histogram!("herald.vendor.latency_ms", "vendor" => candidate.clone())
            .record(duration_ms as f64);

        // 7. Record the attempt and settle
        match result {
            Ok(receipt) => {
                let attempt = DeliveryAttempt::successful(
                    notification.id,
                    &candidate,
                    receipt.vendor_response.clone(),
                    duration_ms,
                );
                self.deps
                    .store
                    .record_attempt(notification.id, &attempt, NotificationStatus::Delivered)
                    .await
                    .map_err(internal)?;

                // The delivery is durable; coordination hiccups must not
                // trigger a redelivery of an already-sent message
                if let Err(e) = self.deps.breaker.record_success(&breaker_key).await {
                    warn!(breaker = %breaker_key, error = %e, "Failed to record breaker success");
                }
                self.deps.tracker.record(&candidate, true);

                info!(
                    event = "notification.delivered",
                    notification_id = %notification.id,
                    vendor = %candidate,
                    message_id = %receipt.message_id,
                    duration_ms = duration_ms,
                    "Notification delivered"
                );
                metrics::counter!("herald.notifications.delivered", "vendor" => candidate.clone())
                    .increment(1);
                metrics::histogram!("herald.dispatch.processing_ms")
                    .record(started.elapsed().as_millis() as f64);

                Ok(ProcessOutcome::Delivered)
            }
            Err(error) => {
                self.handle_delivery_failure(
                    &notification,
                    &candidate,
                    &breaker_key,
                    error,
                    duration_ms,
                )
                .await
            }
        }
    }

    async fn render(
        &self,
        notification: &Notification,
    ) -> Result<
        (
            herald_common::RenderedPayload,
            HashMap<String, serde_json::Value>,
        ),
        DispatchError,
    > {
        let template = self.deps.templates.get(notification.template_id).await?;
        if template.channel != notification.channel {
            return Err(DispatchError::TemplateInvalid(format!(
                "template {} is for channel {}, notification is {}",
                template.name, template.channel, notification.channel
            )));
        }
        let payload = self
            .deps
            .templates
            .render(notification.template_id, &notification.context)
            .await?;
        Ok((payload, template.vendor_metadata))
    }

    async fn fail_on_render(
        &self,
        notification: &Notification,
        error: DispatchError,
        started: Instant,
    ) -> Result<ProcessOutcome, DispatchError> {
        let attempt = DeliveryAttempt::failed(
            notification.id,
            TEMPLATE_VENDOR,
            error.to_string(),
            started.elapsed().as_millis() as u64,
        );
        self.deps
            .store
            .record_attempt(notification.id, &attempt, NotificationStatus::Failed)
            .await
            .map_err(internal)?;

        warn!(
            event = "notification.failed",
            notification_id = %notification.id,
            template_id = %notification.template_id,
            error = %error,
            "Render failed, notification terminal"
        );
        metrics::counter!("herald.notifications.failed", "reason" => "render").increment(1);

        Ok(ProcessOutcome::FailedTerminal)
    }

    /// Every configured vendor was excluded. Attempted-and-excluded means
    /// retries cannot help, so the notification goes terminal; when the
    /// exclusions came from open breakers the message goes to the retry
    /// queue instead, giving a breaker time to half-open.
    async fn no_vendor_outcome(
        &self,
        notification: &Notification,
        breaker_rejected: bool,
        previously_attempted: &[String],
    ) -> Result<ProcessOutcome, DispatchError> {
        let channel = notification.channel;

        if breaker_rejected && notification.attempt_count < self.settings.max_attempts {
            warn!(
                event = "vendor.failover",
                notification_id = %notification.id,
                channel = %channel,
                reason = "no_vendor_available",
                "Every vendor gated by an open breaker; scheduling retry"
            );
            self.deps
                .store
                .transition(notification.id, NotificationStatus::Retrying)
                .await
                .map_err(internal)?;
            let delay = self
                .deps
                .retry
                .schedule(notification, notification.attempt_count.max(1), None)
                .await?;
            return Ok(ProcessOutcome::Retried {
                delay_secs: delay.as_secs(),
            });
        }

        // No untried vendor remains; make the failure durable. A notification
        // that never reached any vendor still gets an attempt row so no
        // terminal outcome is silent.
        if previously_attempted.is_empty() {
            let error = DispatchError::NoVendorAvailable {
                channel: channel.as_str().to_string(),
            };
            let attempt =
                DeliveryAttempt::failed(notification.id, "none", error.to_string(), 0);
            self.deps
                .store
                .record_attempt(notification.id, &attempt, NotificationStatus::Failed)
                .await
                .map_err(internal)?;
        } else {
            self.deps
                .store
                .transition(notification.id, NotificationStatus::Failed)
                .await
                .map_err(internal)?;
        }

        warn!(
            event = "notification.failed",
            notification_id = %notification.id,
            channel = %channel,
            reason = "no_vendor_available",
            "No vendor available, notification terminal"
        );
        metrics::counter!("herald.notifications.failed", "reason" => "no_vendor").increment(1);

        Ok(ProcessOutcome::FailedTerminal)
    }

    async fn handle_delivery_failure(
        &self,
        notification: &Notification,
        vendor: &str,
        breaker_key: &BreakerKey,
        error: DispatchError,
        duration_ms: u64,
    ) -> Result<ProcessOutcome, DispatchError> {
        self.deps.tracker.record(vendor, false);

        // Vendor faults count against the breaker; payload rejections and
        // vendor-side rate limits do not.
        let breaker_fault = matches!(
            error,
            DispatchError::VendorUnavailable { .. } | DispatchError::Timeout { .. }
        );
        if breaker_fault {
            if let Err(e) = self.deps.breaker.record_failure(breaker_key).await {
                warn!(breaker = %breaker_key, error = %e, "Failed to record breaker failure");
            }
        }

        info!(
            event = "notification.attempt",
            notification_id = %notification.id,
            vendor = %vendor,
            error = %error,
            error_code = error.code(),
            duration_ms = duration_ms,
            "Delivery attempt failed"
        );
        metrics::counter!("herald.notifications.attempt_failed", "vendor" => vendor.to_string())
            .increment(1);

        let attempts_after = notification.attempt_count + 1;
        let exhausted = attempts_after >= self.settings.max_attempts;
        let terminal = !error.is_retryable() || exhausted;

        let new_status = if terminal {
            NotificationStatus::Failed
        } else {
            NotificationStatus::Retrying
        };

        let mut attempt =
            DeliveryAttempt::failed(notification.id, vendor, error.to_string(), duration_ms);
        attempt.response = serde_json::json!({"error_code": error.code()});
        self.deps
            .store
            .record_attempt(notification.id, &attempt, new_status)
            .await
            .map_err(internal)?;

        if terminal {
            warn!(
                event = "notification.failed",
                notification_id = %notification.id,
                vendor = %vendor,
                error = %error,
                attempt_count = attempts_after,
                "Notification terminal after failed attempt"
            );
            let reason = if error.is_retryable() { "retries_exhausted" } else { "rejected" };
            metrics::counter!("herald.notifications.failed", "reason" => reason).increment(1);
            return Ok(ProcessOutcome::FailedTerminal);
        }

        if error.rotates_vendor() {
            info!(
                event = "vendor.failover",
                notification_id = %notification.id,
                channel = %notification.channel,
                vendor = %vendor,
                reason = error.code(),
                "Vendor excluded for next attempt"
            );
            metrics::counter!("herald.vendor.failover", "vendor" => vendor.to_string())
                .increment(1);
        }

        // A vendor's Retry-After hint overrides the backoff schedule
        let delay_override = match &error {
            DispatchError::RateLimitedByVendor {
                retry_after_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        };

        let delay = self
            .deps
            .retry
            .schedule(notification, attempts_after, delay_override)
            .await?;

        Ok(ProcessOutcome::Retried {
            delay_secs: delay.as_secs(),
        })
    }
}
