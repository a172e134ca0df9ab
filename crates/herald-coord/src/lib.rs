//! Coordination-store primitives shared by every worker and host.
//!
//! Circuit breaker state, rate-limit counters, and the submission idempotency
//! registry live in Redis so that horizontally scaled workers observe one
//! consistent view. Each primitive also has an in-memory implementation for
//! development mode and tests.

use async_trait::async_trait;
use herald_common::{Channel, OpKind};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryCoordination;
pub use redis_store::RedisCoordination;

pub type Result<T> = std::result::Result<T, CoordError>;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Lock acquisition timed out for {0}")]
    LockTimeout(String),

    #[error("Coordination error: {0}")]
    Other(String),
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Identifies one breaker scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    pub tenant_id: String,
    pub channel: Channel,
    pub vendor: String,
}

impl BreakerKey {
    pub fn new(tenant_id: &str, channel: Channel, vendor: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            channel,
            vendor: vendor.to_string(),
        }
    }

    /// Coordination-store key: `cb:{tenant}:{channel}:{vendor}`.
    pub fn storage_key(&self) -> String {
        format!("cb:{}:{}:{}", self.tenant_id, self.channel, self.vendor)
    }
}

impl std::fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.tenant_id, self.channel, self.vendor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "open" => BreakerState::Open,
            "half_open" => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

/// Point-in-time view of one breaker's stored fields.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_time_ms: Option<i64>,
    pub last_success_time_ms: Option<i64>,
}

/// Outcome of `record_failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Counted; breaker still closed.
    Counted,
    /// This failure crossed the threshold and opened the breaker.
    Tripped,
    /// A half-open probe failed and the breaker re-opened.
    Reopened,
}

/// Breaker tuning, shared by every (tenant, channel, vendor) scope.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    /// Probe window: in half-open, one probe is allowed per window.
    pub half_open_timeout: Duration,
    pub backoff_multiplier: u32,
    /// Exponent cap: effective reset timeout = reset * multiplier^min(excess, cap).
    pub backoff_cap: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_timeout: Duration::from_secs(15),
            backoff_multiplier: 2,
            backoff_cap: 3,
        }
    }
}

impl BreakerSettings {
    /// Effective open->half-open timeout given the accumulated failure count.
    pub fn effective_reset_timeout(&self, failure_count: u32) -> Duration {
        let excess = failure_count
            .saturating_sub(self.failure_threshold)
            .min(self.backoff_cap);
        self.reset_timeout * self.backoff_multiplier.pow(excess)
    }
}

/// Per-vendor fault isolation, atomic against concurrent workers.
///
/// Legal transitions: closed -> open -> half_open -> {closed | open}.
#[async_trait]
pub trait CircuitBreaker: Send + Sync {
    /// Whether a call may proceed. In half-open this grants exactly one probe
    /// per probe window.
    async fn is_available(&self, key: &BreakerKey) -> Result<bool>;

    async fn record_success(&self, key: &BreakerKey) -> Result<()>;

    async fn record_failure(&self, key: &BreakerKey) -> Result<FailureOutcome>;

    async fn snapshot(&self, key: &BreakerKey) -> Result<BreakerSnapshot>;
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// One fixed-window budget.
#[derive(Debug, Clone)]
pub struct RateWindow {
    pub limit: u64,
    pub window: Duration,
    /// Hard ceiling = limit * burst_multiplier.
    pub burst_multiplier: f64,
}

impl RateWindow {
    pub fn per_minute(limit: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(60),
            burst_multiplier: 1.5,
        }
    }

    pub fn burst_ceiling(&self) -> u64 {
        (self.limit as f64 * self.burst_multiplier).floor() as u64
    }

    /// Window index for a given epoch timestamp.
    pub fn window_index(&self, now_secs: i64) -> i64 {
        now_secs / self.window.as_secs() as i64
    }

    /// Seconds until the current window rolls over.
    pub fn seconds_to_rollover(&self, now_secs: i64) -> u64 {
        let window_secs = self.window.as_secs() as i64;
        (window_secs - (now_secs % window_secs)) as u64
    }
}

/// Per-operation budget table with the documented defaults:
/// notification 1000/min, status 2000/min, template 100/hr.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    windows: HashMap<OpKind, RateWindow>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let mut windows = HashMap::new();
        windows.insert(OpKind::Notification, RateWindow::per_minute(1000));
        windows.insert(OpKind::Status, RateWindow::per_minute(2000));
        windows.insert(
            OpKind::Template,
            RateWindow {
                limit: 100,
                window: Duration::from_secs(3600),
                burst_multiplier: 1.5,
            },
        );
        Self { windows }
    }
}

impl RateLimitSettings {
    pub fn new(windows: HashMap<OpKind, RateWindow>) -> Self {
        Self { windows }
    }

    pub fn window(&self, op: OpKind) -> Option<&RateWindow> {
        self.windows.get(&op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u64 },
    Limited { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Distributed fixed-window rate limiter.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Consume one unit of (op, client)'s budget in the current window.
    async fn check(&self, op: OpKind, client: &str) -> Result<RateDecision>;

    /// Units left before the burst ceiling in the current window.
    async fn remaining(&self, op: OpKind, client: &str) -> Result<u64>;
}

// ============================================================================
// Idempotency Registry
// ============================================================================

/// Caller-supplied idempotency keys, retained for the dedup window (24 h).
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Register `notification_id` under (tenant, key) unless the key is
    /// already taken; returns the previously registered id on replay.
    async fn put_if_absent(
        &self,
        tenant_id: &str,
        key: &str,
        notification_id: Uuid,
    ) -> Result<Option<Uuid>>;
}

/// Retention for idempotency keys.
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 3600);

/// Storage key for an idempotency entry.
pub(crate) fn idempotency_key(tenant_id: &str, key: &str) -> String {
    format!("idem:{tenant_id}:{key}")
}

/// Storage key for a rate window: `rate:{op}:{client}:{window}`.
pub(crate) fn rate_key(op: OpKind, client: &str, window_index: i64) -> String {
    format!("rate:{op}:{client}:{window_index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_key_storage_format() {
        let key = BreakerKey::new("acme", Channel::Email, "iterable");
        assert_eq!(key.storage_key(), "cb:acme:email:iterable");
    }

    #[test]
    fn effective_reset_timeout_backs_off_and_caps() {
        let settings = BreakerSettings::default();
        // At the threshold: base timeout
        assert_eq!(settings.effective_reset_timeout(5), Duration::from_secs(30));
        assert_eq!(settings.effective_reset_timeout(6), Duration::from_secs(60));
        assert_eq!(settings.effective_reset_timeout(7), Duration::from_secs(120));
        assert_eq!(settings.effective_reset_timeout(8), Duration::from_secs(240));
        // Capped at 8x
        assert_eq!(settings.effective_reset_timeout(20), Duration::from_secs(240));
    }

    #[test]
    fn rate_window_burst_ceiling() {
        let window = RateWindow::per_minute(1000);
        assert_eq!(window.burst_ceiling(), 1500);
    }

    #[test]
    fn rate_window_rollover() {
        let window = RateWindow::per_minute(1000);
        assert_eq!(window.window_index(0), 0);
        assert_eq!(window.window_index(59), 0);
        assert_eq!(window.window_index(60), 1);
        assert_eq!(window.seconds_to_rollover(45), 15);
    }

    #[test]
    fn rate_key_format() {
        assert_eq!(
            rate_key(OpKind::Notification, "acme", 12345),
            "rate:notification:acme:12345"
        );
    }
}
