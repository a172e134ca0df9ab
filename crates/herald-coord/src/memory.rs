//! In-memory coordination backend for development mode and tests.
//!
//! Implements the same transition table as the Redis backend; atomicity comes
//! from a per-breaker mutex instead of Lua scripts.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Instant;
use uuid::Uuid;

use herald_common::OpKind;

use crate::{
    idempotency_key, rate_key, BreakerKey, BreakerSettings, BreakerSnapshot, BreakerState,
    CircuitBreaker, FailureOutcome, IdempotencyStore, RateDecision, RateLimitSettings,
    RateLimiter, Result, IDEMPOTENCY_TTL,
};

#[derive(Debug, Default)]
struct BreakerEntry {
    state: BreakerState,
    failure_count: u32,
    last_failure_time_ms: Option<i64>,
    last_success_time_ms: Option<i64>,
    probe_at_ms: Option<i64>,
}

pub struct InMemoryCoordination {
    breaker_settings: BreakerSettings,
    rate_settings: RateLimitSettings,
    breakers: DashMap<String, Mutex<BreakerEntry>>,
    counters: DashMap<String, u64>,
    idempotency: DashMap<String, (Uuid, Instant)>,
}

impl InMemoryCoordination {
    pub fn new(breaker_settings: BreakerSettings, rate_settings: RateLimitSettings) -> Self {
        Self {
            breaker_settings,
            rate_settings,
            breakers: DashMap::new(),
            counters: DashMap::new(),
            idempotency: DashMap::new(),
        }
    }

    fn with_entry<T>(&self, key: &BreakerKey, f: impl FnOnce(&mut BreakerEntry) -> T) -> T {
        let entry = self
            .breakers
            .entry(key.storage_key())
            .or_insert_with(|| Mutex::new(BreakerEntry::default()));
        let mut guard = entry.lock();
        f(&mut guard)
    }
}

impl Default for InMemoryCoordination {
    fn default() -> Self {
        Self::new(BreakerSettings::default(), RateLimitSettings::default())
    }
}

#[async_trait]
impl CircuitBreaker for InMemoryCoordination {
    async fn is_available(&self, key: &BreakerKey) -> Result<bool> {
        let settings = self.breaker_settings.clone();
        let now_ms = Utc::now().timestamp_millis();

        let available = self.with_entry(key, |entry| match entry.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let last_failure = entry.last_failure_time_ms.unwrap_or(0);
                let timeout = settings.effective_reset_timeout(entry.failure_count);
                if now_ms - last_failure >= timeout.as_millis() as i64 {
                    entry.state = BreakerState::HalfOpen;
                    entry.probe_at_ms = Some(now_ms);
                    tracing::info!(
                        event = "circuit.state_changed",
                        breaker = %key,
                        from = "open",
                        to = "half_open",
                        "Circuit breaker half-open, probing"
                    );
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                let window_ms = settings.half_open_timeout.as_millis() as i64;
                match entry.probe_at_ms {
                    Some(probe_at) if now_ms - probe_at < window_ms => false,
                    _ => {
                        entry.probe_at_ms = Some(now_ms);
                        true
                    }
                }
            }
        });

        Ok(available)
    }

    async fn record_success(&self, key: &BreakerKey) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();

        self.with_entry(key, |entry| {
            entry.last_success_time_ms = Some(now_ms);
            match entry.state {
                BreakerState::HalfOpen => {
                    entry.state = BreakerState::Closed;
                    entry.failure_count = 0;
                    entry.probe_at_ms = None;
                    tracing::info!(
                        event = "circuit.state_changed",
                        breaker = %key,
                        from = "half_open",
                        to = "closed",
                        "Circuit breaker closed after successful probe"
                    );
                }
                BreakerState::Closed => {
                    entry.failure_count = 0;
                }
                BreakerState::Open => {}
            }
        });

        Ok(())
    }

    async fn record_failure(&self, key: &BreakerKey) -> Result<FailureOutcome> {
        let threshold = self.breaker_settings.failure_threshold;
        let now_ms = Utc::now().timestamp_millis();

        let outcome = self.with_entry(key, |entry| {
            entry.failure_count += 1;
            entry.last_failure_time_ms = Some(now_ms);
            match entry.state {
                BreakerState::HalfOpen => {
                    entry.state = BreakerState::Open;
                    entry.probe_at_ms = None;
                    FailureOutcome::Reopened
                }
                BreakerState::Closed if entry.failure_count >= threshold => {
                    entry.state = BreakerState::Open;
                    FailureOutcome::Tripped
                }
                _ => FailureOutcome::Counted,
            }
        });

        match outcome {
            FailureOutcome::Tripped => {
                tracing::warn!(
                    event = "circuit.state_changed",
                    breaker = %key,
                    from = "closed",
                    to = "open",
                    "Circuit breaker opened"
                );
            }
            FailureOutcome::Reopened => {
                tracing::warn!(
                    event = "circuit.state_changed",
                    breaker = %key,
                    from = "half_open",
                    to = "open",
                    "Circuit breaker re-opened on failed probe"
                );
            }
            FailureOutcome::Counted => {}
        }

        Ok(outcome)
    }

    async fn snapshot(&self, key: &BreakerKey) -> Result<BreakerSnapshot> {
        Ok(self.with_entry(key, |entry| BreakerSnapshot {
            state: entry.state,
            failure_count: entry.failure_count,
            last_failure_time_ms: entry.last_failure_time_ms,
            last_success_time_ms: entry.last_success_time_ms,
        }))
    }
}

#[async_trait]
impl RateLimiter for InMemoryCoordination {
    async fn check(&self, op: OpKind, client: &str) -> Result<RateDecision> {
        let Some(window) = self.rate_settings.window(op) else {
            return Ok(RateDecision::Allowed { remaining: u64::MAX });
        };

        let now_secs = Utc::now().timestamp();
        let bucket = rate_key(op, client, window.window_index(now_secs));
        let burst = window.burst_ceiling();

        let mut entry = self.counters.entry(bucket).or_insert(0);
        if *entry >= burst {
            tracing::warn!(
                event = "rate_limit.exceeded",
                op = %op,
                client = %client,
                "Rate limit exceeded"
            );
            return Ok(RateDecision::Limited {
                retry_after_secs: window.seconds_to_rollover(now_secs),
            });
        }
        *entry += 1;
        let remaining = burst.saturating_sub(*entry);

        Ok(RateDecision::Allowed { remaining })
    }

    async fn remaining(&self, op: OpKind, client: &str) -> Result<u64> {
        let Some(window) = self.rate_settings.window(op) else {
            return Ok(u64::MAX);
        };

        let now_secs = Utc::now().timestamp();
        let bucket = rate_key(op, client, window.window_index(now_secs));
        let count = self.counters.get(&bucket).map(|c| *c).unwrap_or(0);
        Ok(window.burst_ceiling().saturating_sub(count))
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryCoordination {
    async fn put_if_absent(
        &self,
        tenant_id: &str,
        key: &str,
        notification_id: Uuid,
    ) -> Result<Option<Uuid>> {
        let storage_key = idempotency_key(tenant_id, key);

        if let Some(existing) = self.idempotency.get(&storage_key) {
            let (id, inserted_at) = *existing;
            if inserted_at.elapsed() < IDEMPOTENCY_TTL {
                return Ok(Some(id));
            }
        }

        self.idempotency
            .insert(storage_key, (notification_id, Instant::now()));
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RateWindow;
    use herald_common::Channel;
    use std::collections::HashMap;
    use std::time::Duration;

    fn fast_breaker() -> InMemoryCoordination {
        InMemoryCoordination::new(
            BreakerSettings {
                failure_threshold: 5,
                reset_timeout: Duration::from_millis(100),
                half_open_timeout: Duration::from_millis(50),
                backoff_multiplier: 2,
                backoff_cap: 3,
            },
            RateLimitSettings::default(),
        )
    }

    fn key() -> BreakerKey {
        BreakerKey::new("acme", Channel::Email, "iterable")
    }

    #[tokio::test]
    async fn breaker_trips_at_threshold() {
        let coord = fast_breaker();
        let key = key();

        for i in 1..=4 {
            assert_eq!(coord.record_failure(&key).await.unwrap(), FailureOutcome::Counted, "failure {i}");
            assert!(coord.is_available(&key).await.unwrap());
        }

        assert_eq!(coord.record_failure(&key).await.unwrap(), FailureOutcome::Tripped);
        assert!(!coord.is_available(&key).await.unwrap());

        let snapshot = coord.snapshot(&key).await.unwrap();
        assert_eq!(snapshot.state, BreakerState::Open);
        assert_eq!(snapshot.failure_count, 5);
    }

    #[tokio::test]
    async fn open_breaker_half_opens_after_reset_timeout() {
        let coord = fast_breaker();
        let key = key();

        for _ in 0..5 {
            coord.record_failure(&key).await.unwrap();
        }
        assert!(!coord.is_available(&key).await.unwrap());

        tokio::time::sleep(Duration::from_millis(120)).await;

        // First check after the timeout is the probe
        assert!(coord.is_available(&key).await.unwrap());
        assert_eq!(coord.snapshot(&key).await.unwrap().state, BreakerState::HalfOpen);

        // Only one probe per window
        assert!(!coord.is_available(&key).await.unwrap());
    }

    #[tokio::test]
    async fn successful_probe_closes_breaker() {
        let coord = fast_breaker();
        let key = key();

        for _ in 0..5 {
            coord.record_failure(&key).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(coord.is_available(&key).await.unwrap());

        coord.record_success(&key).await.unwrap();

        let snapshot = coord.snapshot(&key).await.unwrap();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert!(coord.is_available(&key).await.unwrap());
    }

    #[tokio::test]
    async fn failed_probe_reopens_breaker() {
        let coord = fast_breaker();
        let key = key();

        for _ in 0..5 {
            coord.record_failure(&key).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(coord.is_available(&key).await.unwrap());

        assert_eq!(coord.record_failure(&key).await.unwrap(), FailureOutcome::Reopened);
        assert_eq!(coord.snapshot(&key).await.unwrap().state, BreakerState::Open);
        assert!(!coord.is_available(&key).await.unwrap());
    }

    #[tokio::test]
    async fn reopened_breaker_backs_off_exponentially() {
        let coord = fast_breaker();
        let key = key();

        for _ in 0..5 {
            coord.record_failure(&key).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(coord.is_available(&key).await.unwrap());
        coord.record_failure(&key).await.unwrap();

        // failure_count is now 6: timeout doubles to 200ms
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!coord.is_available(&key).await.unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(coord.is_available(&key).await.unwrap());
    }

    #[tokio::test]
    async fn success_resets_failure_count_while_closed() {
        let coord = fast_breaker();
        let key = key();

        for _ in 0..4 {
            coord.record_failure(&key).await.unwrap();
        }
        coord.record_success(&key).await.unwrap();
        assert_eq!(coord.snapshot(&key).await.unwrap().failure_count, 0);

        // Threshold counts from scratch again
        for _ in 0..4 {
            assert_eq!(
                coord.record_failure(&key).await.unwrap(),
                FailureOutcome::Counted
            );
        }
    }

    #[tokio::test]
    async fn rate_limiter_allows_up_to_burst_ceiling() {
        let mut windows = HashMap::new();
        windows.insert(
            OpKind::Notification,
            RateWindow {
                limit: 10,
                window: Duration::from_secs(60),
                burst_multiplier: 1.5,
            },
        );
        let coord = InMemoryCoordination::new(
            BreakerSettings::default(),
            RateLimitSettings::new(windows),
        );

        for _ in 0..15 {
            assert!(coord
                .check(OpKind::Notification, "acme")
                .await
                .unwrap()
                .is_allowed());
        }

        let decision = coord.check(OpKind::Notification, "acme").await.unwrap();
        assert!(matches!(decision, RateDecision::Limited { .. }));
        assert_eq!(coord.remaining(OpKind::Notification, "acme").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rate_limiter_isolates_clients() {
        let coord = InMemoryCoordination::default();
        coord.check(OpKind::Notification, "acme").await.unwrap();

        assert_eq!(
            coord.remaining(OpKind::Notification, "acme").await.unwrap(),
            1499
        );
        assert_eq!(
            coord.remaining(OpKind::Notification, "other").await.unwrap(),
            1500
        );
    }

    #[tokio::test]
    async fn idempotency_returns_existing_id_on_replay() {
        let coord = InMemoryCoordination::default();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(
            coord.put_if_absent("acme", "req-1", first).await.unwrap(),
            None
        );
        assert_eq!(
            coord.put_if_absent("acme", "req-1", second).await.unwrap(),
            Some(first)
        );
        // Different key registers fresh
        assert_eq!(
            coord.put_if_absent("acme", "req-2", second).await.unwrap(),
            None
        );
    }
}
