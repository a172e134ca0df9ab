use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;
use uuid::Uuid;

pub mod error;
pub mod logging;

pub use error::DispatchError;

pub type Result<T> = std::result::Result<T, DispatchError>;

// ============================================================================
// Channels, Priorities, Statuses
// ============================================================================

/// Delivery medium for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Push,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Sms, Channel::Push];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
        }
    }

    /// Name of the primary dispatch queue for this channel.
    pub fn queue_name(&self) -> String {
        format!("herald-{}", self.as_str())
    }

    /// Name of the retry queue for this channel.
    pub fn retry_queue_name(&self) -> String {
        format!("herald-{}-retry", self.as_str())
    }

    pub fn parse(s: &str) -> Option<Channel> {
        match s {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "push" => Some(Channel::Push),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

/// Lifecycle state of a notification.
///
/// Created by ingress (`Pending` -> `Queued`), transitioned by workers
/// (`Queued` -> `Processing` -> `Delivered` | `Failed` | `Retrying`).
/// Retries re-enter `Processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Queued,
    Processing,
    Delivered,
    Failed,
    Retrying,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Queued => "queued",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Delivered => "delivered",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Retrying => "retrying",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Notification
// ============================================================================

/// A notification request flowing through the dispatch pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Notification {
    pub id: Uuid,
    pub tenant_id: String,
    pub channel: Channel,
    pub status: NotificationStatus,
    pub priority: Priority,
    pub recipient: String,
    pub template_id: Uuid,
    /// Flat-or-nested string-keyed rendering context.
    #[schema(value_type = Object)]
    pub context: serde_json::Map<String, serde_json::Value>,
    pub attempt_count: i32,
    pub vendor_preference: Option<String>,
    pub batch_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// A notification is terminal after `Delivered`, or after `Failed` once
    /// retries are exhausted.
    pub fn is_terminal(&self, max_retries: i32) -> bool {
        match self.status {
            NotificationStatus::Delivered => true,
            NotificationStatus::Failed => self.attempt_count >= max_retries,
            _ => false,
        }
    }

    /// Whether a worker may pick this notification up for delivery.
    pub fn is_processable(&self, max_retries: i32) -> bool {
        !self.is_terminal(max_retries)
            && matches!(
                self.status,
                NotificationStatus::Queued
                    | NotificationStatus::Processing
                    | NotificationStatus::Retrying
            )
    }
}

// ============================================================================
// Delivery Attempts
// ============================================================================

/// Vendor name recorded on attempts that failed before reaching any vendor
/// (template resolution or rendering errors).
pub const TEMPLATE_VENDOR: &str = "template";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    Successful,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Successful => "successful",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "successful" => Some(Self::Successful),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One durable record of a single vendor invocation for a notification.
/// Append-only; ordered by `attempted_at` per notification.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeliveryAttempt {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub vendor: String,
    pub status: AttemptStatus,
    /// Opaque vendor payload (response body or SDK output).
    pub response: serde_json::Value,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl DeliveryAttempt {
    pub fn successful(notification_id: Uuid, vendor: &str, response: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_id,
            vendor: vendor.to_string(),
            status: AttemptStatus::Successful,
            response,
            error: None,
            attempted_at: Utc::now(),
            duration_ms,
        }
    }

    pub fn failed(notification_id: Uuid, vendor: &str, error: String, duration_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_id,
            vendor: vendor.to_string(),
            status: AttemptStatus::Failed,
            response: serde_json::Value::Null,
            error: Some(error),
            attempted_at: Utc::now(),
            duration_ms,
        }
    }
}

// ============================================================================
// Templates
// ============================================================================

/// Maximum serialized template size (1 MiB).
pub const MAX_TEMPLATE_BYTES: usize = 1024 * 1024;

/// Maximum SMS body length after rendering.
pub const MAX_SMS_BODY_CHARS: usize = 1600;

/// Channel-shaped template content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TemplateContent {
    Email {
        subject: String,
        html: String,
        #[serde(default)]
        text: String,
    },
    Sms {
        body: String,
    },
    Push {
        title: String,
        body: String,
        #[serde(default)]
        data: HashMap<String, String>,
    },
}

impl TemplateContent {
    pub fn channel(&self) -> Channel {
        match self {
            TemplateContent::Email { .. } => Channel::Email,
            TemplateContent::Sms { .. } => Channel::Sms,
            TemplateContent::Push { .. } => Channel::Push,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Template {
    pub id: Uuid,
    pub tenant_id: String,
    /// Unique within a tenant; updates create a new version under the same name.
    pub name: String,
    pub channel: Channel,
    /// Monotonic, starts at 1.
    pub version: i32,
    pub active: bool,
    pub content: TemplateContent,
    /// Per-vendor hints (e.g. an Iterable campaign id).
    #[serde(default)]
    pub vendor_metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A rendered, channel-shaped payload ready for a vendor adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RenderedPayload {
    Email {
        subject: String,
        html: String,
        text: String,
    },
    Sms {
        body: String,
    },
    Push {
        title: String,
        body: String,
        data: HashMap<String, String>,
    },
}

impl RenderedPayload {
    pub fn channel(&self) -> Channel {
        match self {
            RenderedPayload::Email { .. } => Channel::Email,
            RenderedPayload::Sms { .. } => Channel::Sms,
            RenderedPayload::Push { .. } => Channel::Push,
        }
    }
}

// ============================================================================
// Vendor Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VendorState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl VendorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VendorState::Healthy => "healthy",
            VendorState::Degraded => "degraded",
            VendorState::Unhealthy => "unhealthy",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(Self::Healthy),
            "degraded" => Some(Self::Degraded),
            "unhealthy" => Some(Self::Unhealthy),
            _ => None,
        }
    }
}

/// Minimum moving-average success rate for a vendor to count as healthy.
pub const HEALTHY_SUCCESS_RATE: f64 = 0.95;

/// Maximum staleness of a health check for a vendor to count as healthy.
pub const HEALTH_CHECK_FRESHNESS_SECS: i64 = 30;

/// Health snapshot for a (vendor, channel, tenant) as maintained by the
/// background health monitor and read by the vendor selector.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct VendorStatus {
    pub vendor: String,
    pub channel: Channel,
    pub tenant_id: String,
    pub state: VendorState,
    /// Moving average in [0.0, 1.0].
    pub success_rate: f64,
    pub last_check: DateTime<Utc>,
}

impl VendorStatus {
    pub fn is_healthy(&self) -> bool {
        self.state == VendorState::Healthy
            && self.success_rate >= HEALTHY_SUCCESS_RATE
            && (Utc::now() - self.last_check).num_seconds() <= HEALTH_CHECK_FRESHNESS_SECS
    }
}

// ============================================================================
// Queue Wire Types
// ============================================================================

/// Body of a queue message pointing at a persisted notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchJob {
    pub notification_id: Uuid,
    pub tenant_id: String,
    pub priority: Priority,
    #[serde(default)]
    pub attempt_count: i32,
    pub enqueued_at: DateTime<Utc>,
}

impl DispatchJob {
    pub fn new(notification: &Notification) -> Self {
        Self {
            notification_id: notification.id,
            tenant_id: notification.tenant_id.clone(),
            priority: notification.priority,
            attempt_count: notification.attempt_count,
            enqueued_at: Utc::now(),
        }
    }
}

/// A dispatch job received from a queue, with broker tracking metadata.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job: DispatchJob,
    pub receipt_handle: String,
    pub broker_message_id: Option<String>,
    pub queue_identifier: String,
}

// ============================================================================
// Rate-Limited Operations
// ============================================================================

/// Operation classes subject to per-tenant rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Notification,
    Status,
    Template,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Notification => "notification",
            OpKind::Status => "status",
            OpKind::Template => "template",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(status: NotificationStatus, attempts: i32) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            tenant_id: "acme".to_string(),
            channel: Channel::Email,
            status,
            priority: Priority::Normal,
            recipient: "a@b.com".to_string(),
            template_id: Uuid::new_v4(),
            context: serde_json::Map::new(),
            attempt_count: attempts,
            vendor_preference: None,
            batch_id: None,
            metadata: HashMap::new(),
            created_at: Utc::now(),
            queued_at: None,
            processing_started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn delivered_is_terminal() {
        assert!(notification(NotificationStatus::Delivered, 1).is_terminal(3));
    }

    #[test]
    fn failed_is_terminal_only_after_retry_exhaustion() {
        assert!(!notification(NotificationStatus::Failed, 1).is_terminal(3));
        assert!(notification(NotificationStatus::Failed, 3).is_terminal(3));
    }

    #[test]
    fn retrying_is_processable() {
        assert!(notification(NotificationStatus::Retrying, 1).is_processable(3));
        assert!(!notification(NotificationStatus::Pending, 0).is_processable(3));
    }

    #[test]
    fn dispatch_job_wire_format_is_camel_case() {
        let n = notification(NotificationStatus::Queued, 0);
        let job = DispatchJob::new(&n);
        let json = serde_json::to_value(&job).unwrap();
        assert!(json.get("notificationId").is_some());
        assert!(json.get("tenantId").is_some());
        assert!(json.get("enqueuedAt").is_some());
    }

    #[test]
    fn vendor_status_health_requires_fresh_check() {
        let mut status = VendorStatus {
            vendor: "sendgrid".to_string(),
            channel: Channel::Email,
            tenant_id: "acme".to_string(),
            state: VendorState::Healthy,
            success_rate: 0.99,
            last_check: Utc::now(),
        };
        assert!(status.is_healthy());

        status.last_check = Utc::now() - chrono::Duration::seconds(60);
        assert!(!status.is_healthy());

        status.last_check = Utc::now();
        status.success_rate = 0.90;
        assert!(!status.is_healthy());
    }

    #[test]
    fn template_content_channel() {
        let c = TemplateContent::Sms { body: "hi".to_string() };
        assert_eq!(c.channel(), Channel::Sms);
    }
}
