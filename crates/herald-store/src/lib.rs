//! Relational persistence for notifications, delivery attempts, templates,
//! and vendor health snapshots.
//!
//! The traits here are the seam between the dispatch pipeline and storage:
//! `PgStore` backs production, `InMemoryStore` backs development mode and
//! tests. Per-notification transitions are serialized by a row lock
//! (`SELECT ... FOR UPDATE` in Postgres, a per-entry mutex in memory) so the
//! terminal notification status always matches the latest attempt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_common::{
    Channel, DeliveryAttempt, Notification, NotificationStatus, Template, VendorStatus,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub mod cache;
pub mod memory;
pub mod postgres;

pub use cache::StatusCache;
pub use memory::InMemoryStore;
pub use postgres::PgStore;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Version conflict on template {name}: expected {expected}")]
    VersionConflict { name: String, expected: i32 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid stored value: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Cached aggregate returned by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationSummary {
    pub id: Uuid,
    pub tenant_id: String,
    pub channel: Channel,
    pub status: NotificationStatus,
    pub attempt_count: i32,
    pub latest_vendor: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NotificationSummary {
    /// Build the aggregate from the notification row and its attempt log.
    /// Attempts are expected in `attempted_at` order.
    pub fn build(notification: &Notification, attempts: &[DeliveryAttempt]) -> Self {
        let latest = attempts.last();
        Self {
            id: notification.id,
            tenant_id: notification.tenant_id.clone(),
            channel: notification.channel,
            status: notification.status,
            attempt_count: notification.attempt_count,
            latest_vendor: latest.map(|a| a.vendor.clone()),
            last_error: latest.and_then(|a| a.error.clone()),
            created_at: notification.created_at,
            queued_at: notification.queued_at,
            processing_started_at: notification.processing_started_at,
            completed_at: notification.completed_at,
        }
    }
}

/// Notification rows plus their append-only attempt log.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Persist a freshly accepted notification (status `Pending`).
    async fn insert(&self, notification: &Notification) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Notification>>;

    /// Pending -> Queued, stamping `queued_at`.
    async fn mark_queued(&self, id: Uuid) -> Result<()>;

    /// Claim the notification for processing under the row lock: transitions
    /// to `Processing`, stamps `processing_started_at` on the first claim,
    /// and returns the updated row. Returns `None` for unknown ids.
    async fn mark_processing(&self, id: Uuid) -> Result<Option<Notification>>;

    /// Append an attempt and transition the notification in one transaction.
    /// Increments `attempt_count` and stamps `completed_at` on terminal
    /// statuses.
    async fn record_attempt(
        &self,
        id: Uuid,
        attempt: &DeliveryAttempt,
        new_status: NotificationStatus,
    ) -> Result<()>;

    /// Transition status without recording an attempt (used when no vendor
    /// was invoked, e.g. every breaker open). Stamps `completed_at` on
    /// terminal statuses.
    async fn transition(&self, id: Uuid, status: NotificationStatus) -> Result<()>;

    /// Attempt log ordered by `attempted_at`.
    async fn get_attempts(&self, id: Uuid) -> Result<Vec<DeliveryAttempt>>;

    /// Distinct vendors already attempted, for retry exclusion. Render
    /// failures recorded under the template pseudo-vendor are included.
    async fn attempted_vendors(&self, id: Uuid) -> Result<Vec<String>>;

    /// Notifications carrying the given opaque batch tag.
    async fn list_by_batch(&self, tenant_id: &str, batch_id: &str) -> Result<Vec<Notification>>;

    /// Status aggregate for the status endpoint (cache-aside with a 1 h TTL,
    /// invalidated on every transition).
    async fn get_status(&self, id: Uuid) -> Result<Option<NotificationSummary>>;
}

/// Versioned template rows.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Template>>;

    /// Latest active version for (tenant, name).
    async fn find_by_name(&self, tenant_id: &str, name: &str) -> Result<Option<Template>>;

    /// Insert version 1 of a new template name.
    async fn create(&self, template: &Template) -> Result<()>;

    /// Compare-and-set update: succeeds only when `expected_version` is still
    /// the latest, inserting `expected_version + 1` and deactivating the
    /// previous version. Returns the new row.
    async fn update(
        &self,
        tenant_id: &str,
        name: &str,
        expected_version: i32,
        content: herald_common::TemplateContent,
        vendor_metadata: std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<Template>;
}

/// Vendor health snapshots maintained by the health monitor.
#[async_trait]
pub trait VendorStatusStore: Send + Sync {
    async fn upsert(&self, status: &VendorStatus) -> Result<()>;

    async fn get(
        &self,
        vendor: &str,
        channel: Channel,
        tenant_id: &str,
    ) -> Result<Option<VendorStatus>>;

    /// All snapshots for a channel scoped to a tenant (or the global "*"
    /// scope the health monitor writes).
    async fn list(&self, channel: Channel, tenant_id: &str) -> Result<Vec<VendorStatus>>;
}

/// Tenant scope the background health monitor writes under; the selector
/// falls back to it when no tenant-specific snapshot exists.
pub const GLOBAL_TENANT: &str = "*";
