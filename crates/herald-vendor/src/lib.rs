//! Vendor adapters: the uniform contract wrapping each concrete provider.
//!
//! The dispatch pipeline only sees `VendorAdapter`; wire protocols, auth
//! schemes, and response shapes stay opaque behind it. Adapters translate
//! transport and HTTP failures into the dispatch error taxonomy so the worker
//! can decide retry vs. terminal vs. vendor rotation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use herald_common::{Channel, DispatchError, RenderedPayload};
use herald_config::AppConfig;

pub mod http;
pub mod iterable;
pub mod secrets;
pub mod sendgrid;
pub mod ses;
pub mod sns;
pub mod telnyx;
pub mod twilio;

pub use secrets::CredentialResolver;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Budget for vendor health checks; callers abort probes past this.
pub const HEALTH_CHECK_BUDGET_MS: u64 = 500;

/// A rendered notification handed to an adapter for delivery.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub notification_id: Uuid,
    pub tenant_id: String,
    pub recipient: String,
    pub payload: RenderedPayload,
    /// Per-vendor hints from the template (campaign ids, sender overrides).
    pub vendor_metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Sent,
    Queued,
    Failed,
}

/// Result of a successful `send` call.
#[derive(Debug, Clone)]
pub struct VendorReceipt {
    /// Vendor-assigned message identifier.
    pub message_id: String,
    pub status: SendStatus,
    /// Opaque vendor payload, persisted with the attempt.
    pub vendor_response: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Delivery state reported by a vendor's status lookup.
#[derive(Debug, Clone)]
pub struct MessageStatus {
    pub state: String,
    pub timestamps: HashMap<String, DateTime<Utc>>,
    pub attempts: u32,
    pub vendor_metadata: serde_json::Value,
}

impl MessageStatus {
    /// For vendors without a queryable per-message API.
    pub fn unknown() -> Self {
        Self {
            state: "unknown".to_string(),
            timestamps: HashMap::new(),
            attempts: 0,
            vendor_metadata: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VendorHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    pub diagnostics: String,
    pub last_error: Option<String>,
}

impl VendorHealth {
    pub fn healthy(latency_ms: u64, diagnostics: impl Into<String>) -> Self {
        Self {
            healthy: true,
            latency_ms,
            diagnostics: diagnostics.into(),
            last_error: None,
        }
    }

    pub fn unhealthy(latency_ms: u64, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            healthy: false,
            latency_ms,
            diagnostics: "probe failed".to_string(),
            last_error: Some(error),
        }
    }
}

/// Uniform contract over concrete providers.
///
/// Error translation rules:
/// - transport / auth / 5xx -> `VendorUnavailable` (retryable, rotates vendor)
/// - payload-attributable 4xx -> `InvalidPayload` (non-retryable)
/// - 429 -> `RateLimitedByVendor` (retryable after the vendor's hint)
///
/// Adapters never block past the caller-supplied deadline; callers enforce it
/// with a timeout around `send`, and adapters keep their own transport
/// timeouts at or below the configured vendor budget.
#[async_trait]
pub trait VendorAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn channel(&self) -> Channel;

    async fn send(&self, request: &SendRequest) -> Result<VendorReceipt>;

    async fn status(&self, message_id: &str) -> Result<MessageStatus>;

    async fn health(&self) -> VendorHealth;
}

/// Process-wide map from vendor id to adapter, built once at startup.
#[derive(Default)]
pub struct VendorRegistry {
    adapters: HashMap<String, Arc<dyn VendorAdapter>>,
}

impl VendorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn VendorAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, vendor: &str) -> Option<Arc<dyn VendorAdapter>> {
        self.adapters.get(vendor).cloned()
    }

    pub fn contains(&self, vendor: &str) -> bool {
        self.adapters.contains_key(vendor)
    }

    pub fn vendors_for_channel(&self, channel: Channel) -> Vec<String> {
        self.adapters
            .values()
            .filter(|a| a.channel() == channel)
            .map(|a| a.name().to_string())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn VendorAdapter>)> {
        self.adapters.iter()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Build the registry from configuration, resolving each vendor's credential
/// reference. Unknown vendor ids in the configuration are rejected.
pub async fn build_registry(
    config: &AppConfig,
    resolver: &CredentialResolver,
) -> Result<VendorRegistry> {
    let mut registry = VendorRegistry::new();

    for (vendor_id, vendor_config) in &config.vendors {
        let credential = resolver.resolve(&vendor_config.credentials).await?;

        let adapter: Arc<dyn VendorAdapter> = match vendor_id.as_str() {
            "iterable" => Arc::new(iterable::IterableAdapter::new(vendor_config, credential)?),
            "sendgrid" => Arc::new(sendgrid::SendGridAdapter::new(vendor_config, credential)?),
            "ses" => Arc::new(ses::SesAdapter::new(vendor_config, credential)?),
            "telnyx" => Arc::new(telnyx::TelnyxAdapter::new(vendor_config, credential)?),
            "twilio" => Arc::new(twilio::TwilioAdapter::new(vendor_config, credential)?),
            "sns" => Arc::new(sns::SnsAdapter::new(vendor_config).await),
            other => {
                return Err(DispatchError::Internal(format!(
                    "No adapter implementation for configured vendor: {other}"
                )))
            }
        };

        registry.register(adapter);
    }

    Ok(registry)
}
