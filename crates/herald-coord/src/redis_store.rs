//! Redis-backed coordination primitives.
//!
//! Breaker transitions run as Lua scripts so `is_available`,
//! `record_success`, and `record_failure` are single-round-trip atomic
//! against concurrent workers. Rate-limit checks take a short lock (1 s TTL)
//! on the bucket key so a crashed holder cannot deadlock the window.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use herald_common::OpKind;

use crate::{
    idempotency_key, rate_key, BreakerKey, BreakerSettings, BreakerSnapshot, BreakerState,
    CircuitBreaker, CoordError, FailureOutcome, IdempotencyStore, RateDecision, RateLimitSettings,
    RateLimiter, Result, IDEMPOTENCY_TTL,
};

/// Returns 1 when a call may proceed. Transitions open -> half_open once the
/// (exponentially backed off) reset timeout elapses, and grants exactly one
/// probe per half-open window.
/// KEYS[1]=hash; ARGV: now_ms, threshold, reset_ms, half_open_ms, multiplier, cap.
/// Return: 0 denied, 1 allowed, 2 allowed as the half-open transition probe.
const IS_AVAILABLE_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if not state or state == 'closed' then
    return 1
end
local now = tonumber(ARGV[1])
if state == 'open' then
    local last_failure = tonumber(redis.call('HGET', KEYS[1], 'last_failure_time') or '0')
    local failures = tonumber(redis.call('HGET', KEYS[1], 'failure_count') or '0')
    local threshold = tonumber(ARGV[2])
    local excess = failures - threshold
    if excess < 0 then excess = 0 end
    local cap = tonumber(ARGV[6])
    if excess > cap then excess = cap end
    local timeout = tonumber(ARGV[3]) * (tonumber(ARGV[5]) ^ excess)
    if now - last_failure >= timeout then
        redis.call('HSET', KEYS[1], 'state', 'half_open', 'probe_at', now)
        return 2
    end
    return 0
end
-- half_open: one probe per window
local probe_at = tonumber(redis.call('HGET', KEYS[1], 'probe_at') or '0')
if probe_at == 0 or now - probe_at >= tonumber(ARGV[4]) then
    redis.call('HSET', KEYS[1], 'probe_at', now)
    return 1
end
return 0
"#;

/// KEYS[1]=hash; ARGV[1]=now_ms. Return 1 when a half-open probe closed the
/// breaker, else 0.
const RECORD_SUCCESS_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
redis.call('HSET', KEYS[1], 'last_success_time', ARGV[1])
if state == 'half_open' then
    redis.call('HSET', KEYS[1], 'state', 'closed', 'failure_count', 0)
    redis.call('HDEL', KEYS[1], 'probe_at')
    return 1
end
if not state or state == 'closed' then
    redis.call('HSET', KEYS[1], 'failure_count', 0)
end
return 0
"#;

/// KEYS[1]=hash; ARGV: now_ms, threshold.
/// Return: 0 counted, 1 tripped open, 2 half-open probe reopened.
const RECORD_FAILURE_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
local failures = tonumber(redis.call('HGET', KEYS[1], 'failure_count') or '0') + 1
redis.call('HSET', KEYS[1], 'failure_count', failures, 'last_failure_time', ARGV[1])
if state == 'half_open' then
    redis.call('HSET', KEYS[1], 'state', 'open')
    redis.call('HDEL', KEYS[1], 'probe_at')
    return 2
end
if (not state or state == 'closed') and failures >= tonumber(ARGV[2]) then
    redis.call('HSET', KEYS[1], 'state', 'open')
    return 1
end
return 0
"#;

/// KEYS[1]=lock key; ARGV[1]=token. Check-and-delete so only the holder
/// releases.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

/// KEYS[1]=idempotency key; ARGV: notification id, ttl seconds. Returns the
/// existing id on replay, nil when registered fresh.
const PUT_IF_ABSENT_SCRIPT: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then
    return existing
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
return nil
"#;

/// TTL on the per-bucket rate-limit lock.
const RATE_LOCK_TTL_MS: u64 = 1000;
/// How long a checker waits for the bucket lock before giving up.
const RATE_LOCK_WAIT: Duration = Duration::from_millis(1000);
const RATE_LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Redis-backed implementation of every coordination primitive.
#[derive(Clone)]
pub struct RedisCoordination {
    conn: ConnectionManager,
    breaker_settings: BreakerSettings,
    rate_settings: RateLimitSettings,
}

impl RedisCoordination {
    pub async fn connect(
        redis_url: &str,
        breaker_settings: BreakerSettings,
        rate_settings: RateLimitSettings,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            breaker_settings,
            rate_settings,
        })
    }

    pub fn from_connection(
        conn: ConnectionManager,
        breaker_settings: BreakerSettings,
        rate_settings: RateLimitSettings,
    ) -> Self {
        Self {
            conn,
            breaker_settings,
            rate_settings,
        }
    }

    async fn acquire_rate_lock(&self, lock_key: &str) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();
        let deadline = tokio::time::Instant::now() + RATE_LOCK_WAIT;

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(lock_key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(RATE_LOCK_TTL_MS)
                .query_async(&mut conn)
                .await?;

            if acquired.is_some() {
                return Ok(token);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(CoordError::LockTimeout(lock_key.to_string()));
            }
            tokio::time::sleep(RATE_LOCK_RETRY_DELAY).await;
        }
    }

    async fn release_rate_lock(&self, lock_key: &str, token: &str) {
        let mut conn = self.conn.clone();
        let released: std::result::Result<i32, _> = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(lock_key)
            .arg(token)
            .invoke_async(&mut conn)
            .await;

        if let Err(e) = released {
            // The 1s TTL reclaims the lock if this fails
            warn!(lock_key = %lock_key, error = %e, "Failed to release rate-limit lock");
        }
    }
}

#[async_trait]
impl CircuitBreaker for RedisCoordination {
    async fn is_available(&self, key: &BreakerKey) -> Result<bool> {
        let mut conn = self.conn.clone();
        let settings = &self.breaker_settings;

        let verdict: i32 = redis::Script::new(IS_AVAILABLE_SCRIPT)
            .key(key.storage_key())
            .arg(Utc::now().timestamp_millis())
            .arg(settings.failure_threshold)
            .arg(settings.reset_timeout.as_millis() as u64)
            .arg(settings.half_open_timeout.as_millis() as u64)
            .arg(settings.backoff_multiplier)
            .arg(settings.backoff_cap)
            .invoke_async(&mut conn)
            .await?;

        if verdict == 2 {
            tracing::info!(
                event = "circuit.state_changed",
                breaker = %key,
                from = "open",
                to = "half_open",
                "Circuit breaker half-open, probing"
            );
            metrics::gauge!("herald.circuit.open", "vendor" => key.vendor.clone()).decrement(1.0);
        }

        Ok(verdict > 0)
    }

    async fn record_success(&self, key: &BreakerKey) -> Result<()> {
        let mut conn = self.conn.clone();

        let closed: i32 = redis::Script::new(RECORD_SUCCESS_SCRIPT)
            .key(key.storage_key())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        if closed == 1 {
            tracing::info!(
                event = "circuit.state_changed",
                breaker = %key,
                from = "half_open",
                to = "closed",
                "Circuit breaker closed after successful probe"
            );
        }

        Ok(())
    }

    async fn record_failure(&self, key: &BreakerKey) -> Result<FailureOutcome> {
        let mut conn = self.conn.clone();

        let verdict: i32 = redis::Script::new(RECORD_FAILURE_SCRIPT)
            .key(key.storage_key())
            .arg(Utc::now().timestamp_millis())
            .arg(self.breaker_settings.failure_threshold)
            .invoke_async(&mut conn)
            .await?;

        let outcome = match verdict {
            1 => FailureOutcome::Tripped,
            2 => FailureOutcome::Reopened,
            _ => FailureOutcome::Counted,
        };

        match outcome {
            FailureOutcome::Tripped => {
                tracing::warn!(
                    event = "circuit.state_changed",
                    breaker = %key,
                    from = "closed",
                    to = "open",
                    "Circuit breaker opened"
                );
                metrics::gauge!("herald.circuit.open", "vendor" => key.vendor.clone()).increment(1.0);
            }
            FailureOutcome::Reopened => {
                tracing::warn!(
                    event = "circuit.state_changed",
                    breaker = %key,
                    from = "half_open",
                    to = "open",
                    "Circuit breaker re-opened on failed probe"
                );
                metrics::gauge!("herald.circuit.open", "vendor" => key.vendor.clone()).increment(1.0);
            }
            FailureOutcome::Counted => {}
        }

        Ok(outcome)
    }

    async fn snapshot(&self, key: &BreakerKey) -> Result<BreakerSnapshot> {
        let mut conn = self.conn.clone();

        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key.storage_key())
            .query_async(&mut conn)
            .await?;

        Ok(BreakerSnapshot {
            state: fields
                .get("state")
                .map(|s| BreakerState::from_str(s))
                .unwrap_or(BreakerState::Closed),
            failure_count: fields
                .get("failure_count")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            last_failure_time_ms: fields.get("last_failure_time").and_then(|s| s.parse().ok()),
            last_success_time_ms: fields.get("last_success_time").and_then(|s| s.parse().ok()),
        })
    }
}

#[async_trait]
impl RateLimiter for RedisCoordination {
    async fn check(&self, op: OpKind, client: &str) -> Result<RateDecision> {
        let Some(window) = self.rate_settings.window(op) else {
            debug!(op = %op, "No rate limit configured, allowing");
            return Ok(RateDecision::Allowed { remaining: u64::MAX });
        };

        let now_secs = Utc::now().timestamp();
        let bucket = rate_key(op, client, window.window_index(now_secs));
        let lock_key = format!("lock:{bucket}");

        let token = self.acquire_rate_lock(&lock_key).await?;

        let result = async {
            let mut conn = self.conn.clone();

            let count: Option<u64> = redis::cmd("GET")
                .arg(&bucket)
                .query_async(&mut conn)
                .await?;
            let count = count.unwrap_or(0);

            let burst = window.burst_ceiling();
            if count >= burst {
                return Ok(RateDecision::Limited {
                    retry_after_secs: window.seconds_to_rollover(now_secs),
                });
            }

            let new_count: u64 = redis::cmd("INCR")
                .arg(&bucket)
                .query_async(&mut conn)
                .await?;
            if new_count == 1 {
                let _: () = redis::cmd("EXPIRE")
                    .arg(&bucket)
                    .arg(window.window.as_secs())
                    .query_async(&mut conn)
                    .await?;
            }

            Ok(RateDecision::Allowed {
                remaining: burst.saturating_sub(new_count),
            })
        }
        .await;

        self.release_rate_lock(&lock_key, &token).await;

        if let Ok(RateDecision::Limited { retry_after_secs }) = &result {
            tracing::warn!(
                event = "rate_limit.exceeded",
                op = %op,
                client = %client,
                retry_after_secs = retry_after_secs,
                "Rate limit exceeded"
            );
            metrics::counter!("herald.rate_limit.exceeded", "op" => op.as_str()).increment(1);
        }

        result
    }

    async fn remaining(&self, op: OpKind, client: &str) -> Result<u64> {
        let Some(window) = self.rate_settings.window(op) else {
            return Ok(u64::MAX);
        };

        let now_secs = Utc::now().timestamp();
        let bucket = rate_key(op, client, window.window_index(now_secs));
        let mut conn = self.conn.clone();

        let count: Option<u64> = redis::cmd("GET")
            .arg(&bucket)
            .query_async(&mut conn)
            .await?;

        Ok(window.burst_ceiling().saturating_sub(count.unwrap_or(0)))
    }
}

#[async_trait]
impl IdempotencyStore for RedisCoordination {
    async fn put_if_absent(
        &self,
        tenant_id: &str,
        key: &str,
        notification_id: Uuid,
    ) -> Result<Option<Uuid>> {
        let mut conn = self.conn.clone();

        let existing: Option<String> = redis::Script::new(PUT_IF_ABSENT_SCRIPT)
            .key(idempotency_key(tenant_id, key))
            .arg(notification_id.to_string())
            .arg(IDEMPOTENCY_TTL.as_secs())
            .invoke_async(&mut conn)
            .await?;

        Ok(existing.and_then(|s| Uuid::parse_str(&s).ok()))
    }
}
