//! Shared HTTP plumbing for REST-based vendor adapters.

use reqwest::{Client, Response, StatusCode};
use std::time::Duration;

use herald_common::DispatchError;

use crate::Result;

/// Build the adapter's HTTP client with the vendor's call budget as the
/// request timeout, so a slow vendor can never hold a dispatch slot past it.
pub fn build_client(timeout_ms: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .connect_timeout(Duration::from_millis(timeout_ms.min(2_000)))
        .pool_max_idle_per_host(10)
        .build()
        .map_err(|e| DispatchError::Internal(format!("Failed to build HTTP client: {e}")))
}

/// Translate a transport-level failure.
pub fn classify_transport_error(vendor: &str, e: reqwest::Error) -> DispatchError {
    let reason = if e.is_timeout() {
        "request timeout".to_string()
    } else if e.is_connect() {
        format!("connection error: {e}")
    } else {
        format!("request failed: {e}")
    };
    DispatchError::VendorUnavailable {
        vendor: vendor.to_string(),
        reason,
    }
}

/// Translate a non-success HTTP status per the adapter contract:
/// 429 -> `RateLimitedByVendor`; auth and 5xx -> `VendorUnavailable`;
/// remaining 4xx are payload-attributable -> `InvalidPayload`.
pub fn classify_error_status(
    vendor: &str,
    status: StatusCode,
    retry_after_secs: Option<u64>,
    body: &str,
) -> DispatchError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return DispatchError::RateLimitedByVendor {
            vendor: vendor.to_string(),
            retry_after_secs,
        };
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return DispatchError::VendorUnavailable {
            vendor: vendor.to_string(),
            reason: format!("auth rejected: HTTP {}", status.as_u16()),
        };
    }
    if status.is_client_error() {
        return DispatchError::InvalidPayload(format!(
            "{vendor} rejected payload: HTTP {} {}",
            status.as_u16(),
            truncate(body, 200)
        ));
    }
    DispatchError::VendorUnavailable {
        vendor: vendor.to_string(),
        reason: format!("HTTP {} {}", status.as_u16(), truncate(body, 200)),
    }
}

/// Parse a Retry-After header (seconds form).
pub fn retry_after_secs(response: &Response) -> Option<u64> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
