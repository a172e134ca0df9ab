//! Retry scheduling: exponential backoff with jitter onto per-channel retry
//! queues.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use herald_common::{Channel, DispatchError, DispatchJob, Notification};
use herald_queue::QueuePublisher;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_pct: u32,
    pub max_attempts: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_pct: 10,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// `base * 2^(attempt_count - 1)`, clamped to [base, max], with
    /// +/- jitter_pct% jitter.
    pub fn compute_delay(&self, attempt_count: i32) -> Duration {
        let exponent = attempt_count.max(1) - 1;
        let unjittered = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent.min(30) as u32))
            .min(self.max_delay)
            .max(self.base_delay);

        let jitter_range = self.jitter_pct as f64 / 100.0;
        let factor = 1.0 + rand::rng().random_range(-jitter_range..=jitter_range);
        Duration::from_secs_f64(unjittered.as_secs_f64() * factor)
    }
}

pub struct RetryScheduler {
    publishers: HashMap<Channel, Arc<dyn QueuePublisher>>,
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(publishers: HashMap<Channel, Arc<dyn QueuePublisher>>, policy: RetryPolicy) -> Self {
        Self { publishers, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Enqueue the notification onto its channel's retry queue with a
    /// visibility delay. `delay_override` carries a vendor's Retry-After
    /// hint; otherwise the backoff schedule applies to the attempt count the
    /// notification has just reached.
    pub async fn schedule(
        &self,
        notification: &Notification,
        attempt_count: i32,
        delay_override: Option<Duration>,
    ) -> Result<Duration, DispatchError> {
        let delay = delay_override.unwrap_or_else(|| self.policy.compute_delay(attempt_count));

        let publisher = self
            .publishers
            .get(&notification.channel)
            .ok_or_else(|| {
                DispatchError::Internal(format!(
                    "No retry queue for channel {}",
                    notification.channel
                ))
            })?;

        let mut job = DispatchJob::new(notification);
        job.attempt_count = attempt_count;

        publisher
            .publish_delayed(job, delay.as_secs() as u32)
            .await
            .map_err(|e| DispatchError::Internal(format!("Retry enqueue failed: {e}")))?;

        debug!(
            notification_id = %notification.id,
            attempt_count = attempt_count,
            delay_ms = delay.as_millis() as u64,
            "Retry scheduled"
        );
        metrics::counter!("herald.retries.scheduled").increment(1);

        Ok(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    fn assert_within_jitter(delay: Duration, expected_secs: f64) {
        let secs = delay.as_secs_f64();
        assert!(
            secs >= expected_secs * 0.89 && secs <= expected_secs * 1.11,
            "delay {secs}s outside jitter band around {expected_secs}s"
        );
    }

    #[test]
    fn backoff_schedule_doubles() {
        let policy = policy();
        assert_within_jitter(policy.compute_delay(1), 1.0);
        assert_within_jitter(policy.compute_delay(2), 2.0);
        assert_within_jitter(policy.compute_delay(3), 4.0);
    }

    #[test]
    fn delay_is_clamped_to_max() {
        let policy = policy();
        // 2^19 seconds would be ~6 days; the clamp holds it at 300s
        let delay = policy.compute_delay(20);
        assert!(delay <= Duration::from_secs_f64(300.0 * 1.11));
        assert!(delay >= Duration::from_secs_f64(300.0 * 0.89));
    }

    #[test]
    fn attempt_zero_is_treated_as_first() {
        let policy = policy();
        assert_within_jitter(policy.compute_delay(0), 1.0);
    }

    #[test]
    fn jitter_varies_between_calls() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(3600),
            ..policy()
        };
        // With 10% jitter on a large base, 32 draws collide only if jitter
        // is broken
        let base: Vec<u128> = (0..32)
            .map(|_| policy.compute_delay(10).as_millis())
            .collect();
        let all_equal = base.windows(2).all(|w| w[0] == w[1]);
        assert!(!all_equal, "jitter produced identical delays");
    }
}
