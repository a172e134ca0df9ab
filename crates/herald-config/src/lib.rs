//! Herald configuration system.
//!
//! TOML-based configuration with environment variable override support.

use herald_common::Channel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    /// Ordered vendor lists per channel, with per-tenant overrides.
    pub channels: HashMap<String, ChannelConfig>,
    /// Per-vendor credentials and call budgets.
    pub vendors: HashMap<String, VendorConfig>,
    /// Per-operation rate limits.
    pub rate_limits: HashMap<String, RateLimitConfig>,
    pub breaker: BreakerConfig,
    pub template_cache: TemplateCacheConfig,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
    pub feature_flags: FeatureFlags,

    /// Data directory for embedded-queue storage.
    pub data_dir: String,

    /// Enable development mode (embedded queue, in-memory coordination).
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            queue: QueueConfig::default(),
            channels: default_channels(),
            vendors: HashMap::new(),
            rate_limits: default_rate_limits(),
            breaker: BreakerConfig::default(),
            template_cache: TemplateCacheConfig::default(),
            retry: RetryConfig::default(),
            worker: WorkerConfig::default(),
            feature_flags: FeatureFlags::default(),
            data_dir: "./data".to_string(),
            dev_mode: false,
        }
    }
}

fn default_channels() -> HashMap<String, ChannelConfig> {
    let mut channels = HashMap::new();
    channels.insert(
        "email".to_string(),
        ChannelConfig::new(vec!["iterable", "sendgrid", "ses"]),
    );
    channels.insert(
        "sms".to_string(),
        ChannelConfig::new(vec!["telnyx", "twilio"]),
    );
    channels.insert("push".to_string(), ChannelConfig::new(vec!["sns"]));
    channels
}

fn default_rate_limits() -> HashMap<String, RateLimitConfig> {
    let mut limits = HashMap::new();
    limits.insert("notification".to_string(), RateLimitConfig::per_minute(1000));
    limits.insert("status".to_string(), RateLimitConfig::per_minute(2000));
    limits.insert(
        "template".to_string(),
        RateLimitConfig {
            limit: 100,
            window_seconds: 3600,
            burst_multiplier: default_burst_multiplier(),
        },
    );
    limits
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Relational store configuration (Postgres).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/herald".to_string(),
            max_connections: 20,
        }
    }
}

/// Coordination store configuration (Redis).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// "sqs" for production, "embedded" for local development.
    pub backend: String,
    pub sqs: SqsConfig,
    /// Long-poll receive wait in seconds (SQS max 20).
    pub wait_time_seconds: u32,
    /// Visibility timeout for in-flight messages.
    pub visibility_timeout_seconds: u32,
    /// Maximum messages per receive batch (SQS max 10).
    pub max_batch_size: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: "embedded".to_string(),
            sqs: SqsConfig::default(),
            wait_time_seconds: 20,
            visibility_timeout_seconds: 30,
            max_batch_size: 10,
        }
    }
}

/// AWS SQS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqsConfig {
    /// Base URL; queue names are appended (e.g. ".../herald-email").
    pub queue_url_prefix: String,
    pub region: String,
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            queue_url_prefix: String::new(),
            region: "us-east-1".to_string(),
        }
    }
}

/// Ordered vendor list for a channel.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChannelConfig {
    /// Global default ordering; position is the failover order.
    pub vendors: Vec<String>,
    /// Per-tenant vendor ordering, falling back to `vendors`.
    pub tenant_overrides: HashMap<String, Vec<String>>,
}

impl ChannelConfig {
    pub fn new(vendors: Vec<&str>) -> Self {
        Self {
            vendors: vendors.into_iter().map(String::from).collect(),
            tenant_overrides: HashMap::new(),
        }
    }

    /// Ordered vendor ids for a tenant.
    pub fn vendors_for(&self, tenant_id: &str) -> &[String] {
        self.tenant_overrides
            .get(tenant_id)
            .map(|v| v.as_slice())
            .unwrap_or(&self.vendors)
    }
}

/// Per-vendor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorConfig {
    /// Secret reference (`env://VAR` or `aws-sm://name`) for the vendor
    /// credential. Format depends on the vendor (API key, "user:pass", ARN).
    pub credentials: String,
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    /// Vendor-specific settings (sender address, base URL overrides, etc.).
    pub settings: HashMap<String, String>,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            credentials: String::new(),
            timeout_ms: 5_000,
            retry_attempts: 3,
            settings: HashMap::new(),
        }
    }
}

fn default_burst_multiplier() -> f64 {
    1.5
}

/// Fixed-window rate limit for one operation class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub limit: u64,
    pub window_seconds: u64,
    /// Hard ceiling = limit * burst_multiplier.
    pub burst_multiplier: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_minute(1000)
    }
}

impl RateLimitConfig {
    pub fn per_minute(limit: u64) -> Self {
        Self {
            limit,
            window_seconds: 60,
            burst_multiplier: default_burst_multiplier(),
        }
    }

    pub fn burst_ceiling(&self) -> u64 {
        (self.limit as f64 * self.burst_multiplier).floor() as u64
    }
}

/// Circuit breaker parameters, shared by all (tenant, channel, vendor) scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_seconds: u64,
    pub half_open_timeout_seconds: u64,
    pub backoff_multiplier: u32,
    /// Exponent cap: reset timeout scales by multiplier^min(excess, cap).
    pub backoff_cap: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_seconds: 30,
            half_open_timeout_seconds: 15,
            backoff_multiplier: 2,
            backoff_cap: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateCacheConfig {
    pub ttl_seconds: u64,
    pub negative_ttl_seconds: u64,
}

impl Default for TemplateCacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            negative_ttl_seconds: 60,
        }
    }
}

/// Retry backoff policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub jitter_pct: u32,
    pub max_attempts: i32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: 1,
            max_delay_seconds: 300,
            jitter_pct: 10,
            max_attempts: 3,
        }
    }
}

/// Dispatch worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent task slots per channel pool.
    pub concurrency: u32,
    /// End-to-end deadline per message in seconds.
    pub max_e2e_latency_seconds: u64,
    /// Backoff applied to the poll loop after a rate-limit denial.
    pub rate_limit_backoff_seconds: u64,
    /// Vendor health-check interval.
    pub health_check_interval_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_e2e_latency_seconds: 30,
            rate_limit_backoff_seconds: 5,
            health_check_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub multi_region: bool,
    pub vendor_failover: bool,
    pub rate_limiting: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            multi_region: false,
            vendor_failover: true,
            rate_limiting: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate cross-references: every channel is known, every vendor named
    /// in a channel ordering has a vendor entry, and limits are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (channel, channel_config) in &self.channels {
            if Channel::parse(channel).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown channel: {channel}"
                )));
            }
            if channel_config.vendors.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Channel {channel} has no vendors configured"
                )));
            }
            let all_orderings = std::iter::once(&channel_config.vendors)
                .chain(channel_config.tenant_overrides.values());
            for ordering in all_orderings {
                for vendor in ordering {
                    if !self.vendors.contains_key(vendor) {
                        return Err(ConfigError::ValidationError(format!(
                            "Channel {channel} references unconfigured vendor: {vendor}"
                        )));
                    }
                }
            }
        }

        for (op, limit) in &self.rate_limits {
            if limit.limit == 0 || limit.window_seconds == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Rate limit for {op} must have nonzero limit and window"
                )));
            }
            if limit.burst_multiplier < 1.0 {
                return Err(ConfigError::ValidationError(format!(
                    "Burst multiplier for {op} must be >= 1.0"
                )));
            }
        }

        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "Breaker failure threshold must be nonzero".to_string(),
            ));
        }

        if self.retry.max_attempts < 1 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Vendor ordering for a (channel, tenant), empty if the channel is not
    /// configured.
    pub fn vendor_order(&self, channel: Channel, tenant_id: &str) -> Vec<String> {
        self.channels
            .get(channel.as_str())
            .map(|c| c.vendors_for(tenant_id).to_vec())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_when_vendors_present() {
        let mut config = AppConfig::default();
        for vendor in ["iterable", "sendgrid", "ses", "telnyx", "twilio", "sns"] {
            config.vendors.insert(vendor.to_string(), VendorConfig::default());
        }
        config.validate().unwrap();
    }

    #[test]
    fn default_channels_match_spec_ordering() {
        let config = AppConfig::default();
        assert_eq!(
            config.vendor_order(Channel::Email, "anyone"),
            vec!["iterable", "sendgrid", "ses"]
        );
        assert_eq!(config.vendor_order(Channel::Sms, "anyone"), vec!["telnyx", "twilio"]);
        assert_eq!(config.vendor_order(Channel::Push, "anyone"), vec!["sns"]);
    }

    #[test]
    fn tenant_override_takes_precedence() {
        let mut config = AppConfig::default();
        config
            .channels
            .get_mut("email")
            .unwrap()
            .tenant_overrides
            .insert("acme".to_string(), vec!["sendgrid".to_string()]);

        assert_eq!(config.vendor_order(Channel::Email, "acme"), vec!["sendgrid"]);
        assert_eq!(
            config.vendor_order(Channel::Email, "other"),
            vec!["iterable", "sendgrid", "ses"]
        );
    }

    #[test]
    fn default_rate_limits_match_spec() {
        let config = AppConfig::default();
        let n = &config.rate_limits["notification"];
        assert_eq!((n.limit, n.window_seconds), (1000, 60));
        assert_eq!(n.burst_ceiling(), 1500);

        let t = &config.rate_limits["template"];
        assert_eq!((t.limit, t.window_seconds), (100, 3600));
    }

    #[test]
    fn unknown_vendor_fails_validation() {
        let mut config = AppConfig::default();
        config.vendors.clear();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn breaker_defaults_match_spec() {
        let breaker = BreakerConfig::default();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.reset_timeout_seconds, 30);
        assert_eq!(breaker.half_open_timeout_seconds, 15);
        assert_eq!(breaker.backoff_multiplier, 2);
        assert_eq!(breaker.backoff_cap, 3);
    }

    #[test]
    fn toml_round_trip() {
        let toml_src = r#"
            dev_mode = true

            [http]
            port = 9090

            [vendors.sendgrid]
            credentials = "env://SENDGRID_API_KEY"
            timeout_ms = 2500

            [channels.email]
            vendors = ["sendgrid"]

            [rate_limits.notification]
            limit = 50
            window_seconds = 60
        "#;
        let config: AppConfig = toml::from_str(toml_src).unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.http.port, 9090);
        assert_eq!(config.vendors["sendgrid"].timeout_ms, 2500);
        assert_eq!(config.vendors["sendgrid"].retry_attempts, 3);
        assert_eq!(config.channels["email"].vendors, vec!["sendgrid"]);
        assert_eq!(config.rate_limits["notification"].limit, 50);
    }
}
