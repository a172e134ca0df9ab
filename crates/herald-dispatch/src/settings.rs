//! Mapping from the loaded AppConfig onto the runtime settings types of the
//! coordination and dispatch layers. Shared by both binaries.

use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use herald_common::OpKind;
use herald_config::AppConfig;
use herald_coord::{BreakerSettings, RateLimitSettings, RateWindow};

use crate::pipeline::DispatchSettings;
use crate::retry::RetryPolicy;

pub fn breaker_settings(config: &AppConfig) -> BreakerSettings {
    BreakerSettings {
        failure_threshold: config.breaker.failure_threshold,
        reset_timeout: Duration::from_secs(config.breaker.reset_timeout_seconds),
        half_open_timeout: Duration::from_secs(config.breaker.half_open_timeout_seconds),
        backoff_multiplier: config.breaker.backoff_multiplier,
        backoff_cap: config.breaker.backoff_cap,
    }
}

pub fn rate_limit_settings(config: &AppConfig) -> RateLimitSettings {
    let mut windows = HashMap::new();
    for (op, limit) in &config.rate_limits {
        let kind = match op.as_str() {
            "notification" => OpKind::Notification,
            "status" => OpKind::Status,
            "template" => OpKind::Template,
            other => {
                warn!(op = %other, "Unknown rate-limit operation in config, ignoring");
                continue;
            }
        };
        windows.insert(
            kind,
            RateWindow {
                limit: limit.limit,
                window: Duration::from_secs(limit.window_seconds),
                burst_multiplier: limit.burst_multiplier,
            },
        );
    }
    RateLimitSettings::new(windows)
}

pub fn retry_policy(config: &AppConfig) -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_secs(config.retry.base_delay_seconds),
        max_delay: Duration::from_secs(config.retry.max_delay_seconds),
        jitter_pct: config.retry.jitter_pct,
        max_attempts: config.retry.max_attempts,
    }
}

pub fn dispatch_settings(config: &AppConfig) -> DispatchSettings {
    let vendor_timeouts = config
        .vendors
        .iter()
        .map(|(vendor, vendor_config)| {
            (
                vendor.clone(),
                Duration::from_millis(vendor_config.timeout_ms),
            )
        })
        .collect();

    DispatchSettings {
        max_attempts: config.retry.max_attempts,
        max_e2e_latency: Duration::from_secs(config.worker.max_e2e_latency_seconds),
        default_vendor_timeout: Duration::from_secs(5),
        vendor_timeouts,
        vendor_failover: config.feature_flags.vendor_failover,
        rate_limiting: config.feature_flags.rate_limiting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_map_onto_spec_values() {
        let config = AppConfig::default();

        let breaker = breaker_settings(&config);
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.reset_timeout, Duration::from_secs(30));

        let retry = retry_policy(&config);
        assert_eq!(retry.base_delay, Duration::from_secs(1));
        assert_eq!(retry.max_delay, Duration::from_secs(300));
        assert_eq!(retry.max_attempts, 3);

        let dispatch = dispatch_settings(&config);
        assert_eq!(dispatch.max_e2e_latency, Duration::from_secs(30));
        assert!(dispatch.vendor_failover);

        let limits = rate_limit_settings(&config);
        assert_eq!(limits.window(OpKind::Notification).unwrap().limit, 1000);
        assert_eq!(limits.window(OpKind::Template).unwrap().window, Duration::from_secs(3600));
    }

    #[test]
    fn vendor_timeouts_come_from_vendor_config() {
        let mut config = AppConfig::default();
        let mut vendor = herald_config::VendorConfig::default();
        vendor.timeout_ms = 2_500;
        config.vendors.insert("sendgrid".to_string(), vendor);

        let dispatch = dispatch_settings(&config);
        assert_eq!(
            dispatch.vendor_timeouts.get("sendgrid"),
            Some(&Duration::from_millis(2_500))
        );
    }
}
