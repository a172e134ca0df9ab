//! Postgres store backend.
//!
//! Runtime-checked sqlx queries; JSON-shaped columns are stored as TEXT and
//! (de)serialized at the boundary. Per-notification transitions take the row
//! lock (`SELECT ... FOR UPDATE`) inside one transaction with the attempt
//! append, preserving the terminal-status/latest-attempt invariant.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use herald_common::{
    AttemptStatus, Channel, DeliveryAttempt, Notification, NotificationStatus, Priority, Template,
    TemplateContent, VendorState, VendorStatus,
};

use crate::{
    NotificationStore, NotificationSummary, Result, StatusCache, StoreError, TemplateStore,
    VendorStatusStore,
};

pub struct PgStore {
    pool: PgPool,
    status_cache: StatusCache,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            status_cache: StatusCache::default(),
        }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                recipient TEXT NOT NULL,
                template_id UUID NOT NULL,
                context TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                vendor_preference TEXT,
                batch_id TEXT,
                metadata TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                queued_at TIMESTAMPTZ,
                processing_started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_notifications_tenant_status
            ON notifications (tenant_id, status, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_notifications_batch
            ON notifications (batch_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delivery_attempts (
                id UUID PRIMARY KEY,
                notification_id UUID NOT NULL REFERENCES notifications(id),
                vendor TEXT NOT NULL,
                status TEXT NOT NULL,
                response TEXT NOT NULL,
                error TEXT,
                attempted_at TIMESTAMPTZ NOT NULL,
                duration_ms BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_attempts_notification
            ON delivery_attempts (notification_id, attempted_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS templates (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                channel TEXT NOT NULL,
                version INTEGER NOT NULL,
                active BOOLEAN NOT NULL,
                content TEXT NOT NULL,
                vendor_metadata TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ,
                UNIQUE (tenant_id, name, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_templates_name
            ON templates (tenant_id, name, version, active)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vendor_status (
                vendor TEXT NOT NULL,
                channel TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                state TEXT NOT NULL,
                success_rate DOUBLE PRECISION NOT NULL,
                last_check TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (vendor, channel, tenant_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Postgres store schema initialized");
        Ok(())
    }
}

fn parse_channel(s: &str) -> Result<Channel> {
    Channel::parse(s).ok_or_else(|| StoreError::Corrupt(format!("unknown channel: {s}")))
}

fn parse_status(s: &str) -> Result<NotificationStatus> {
    NotificationStatus::from_str(s)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown status: {s}")))
}

fn parse_priority(s: &str) -> Result<Priority> {
    match s {
        "high" => Ok(Priority::High),
        "normal" => Ok(Priority::Normal),
        "low" => Ok(Priority::Low),
        other => Err(StoreError::Corrupt(format!("unknown priority: {other}"))),
    }
}

fn row_to_notification(row: &PgRow) -> Result<Notification> {
    let channel: String = row.try_get("channel")?;
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let context: String = row.try_get("context")?;
    let metadata: String = row.try_get("metadata")?;

    Ok(Notification {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        channel: parse_channel(&channel)?,
        status: parse_status(&status)?,
        priority: parse_priority(&priority)?,
        recipient: row.try_get("recipient")?,
        template_id: row.try_get("template_id")?,
        context: serde_json::from_str(&context)?,
        attempt_count: row.try_get("attempt_count")?,
        vendor_preference: row.try_get("vendor_preference")?,
        batch_id: row.try_get("batch_id")?,
        metadata: serde_json::from_str(&metadata)?,
        created_at: row.try_get("created_at")?,
        queued_at: row.try_get("queued_at")?,
        processing_started_at: row.try_get("processing_started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn row_to_attempt(row: &PgRow) -> Result<DeliveryAttempt> {
    let status: String = row.try_get("status")?;
    let response: String = row.try_get("response")?;
    let duration_ms: i64 = row.try_get("duration_ms")?;

    Ok(DeliveryAttempt {
        id: row.try_get("id")?,
        notification_id: row.try_get("notification_id")?,
        vendor: row.try_get("vendor")?,
        status: AttemptStatus::from_str(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown attempt status: {status}")))?,
        response: serde_json::from_str(&response)?,
        error: row.try_get("error")?,
        attempted_at: row.try_get("attempted_at")?,
        duration_ms: duration_ms as u64,
    })
}

fn row_to_template(row: &PgRow) -> Result<Template> {
    let channel: String = row.try_get("channel")?;
    let content: String = row.try_get("content")?;
    let vendor_metadata: String = row.try_get("vendor_metadata")?;

    Ok(Template {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        channel: parse_channel(&channel)?,
        version: row.try_get("version")?,
        active: row.try_get("active")?,
        content: serde_json::from_str(&content)?,
        vendor_metadata: serde_json::from_str(&vendor_metadata)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_vendor_status(row: &PgRow) -> Result<VendorStatus> {
    let channel: String = row.try_get("channel")?;
    let state: String = row.try_get("state")?;

    Ok(VendorStatus {
        vendor: row.try_get("vendor")?,
        channel: parse_channel(&channel)?,
        tenant_id: row.try_get("tenant_id")?,
        state: VendorState::from_str(&state)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown vendor state: {state}")))?,
        success_rate: row.try_get("success_rate")?,
        last_check: row.try_get("last_check")?,
    })
}

#[async_trait]
impl NotificationStore for PgStore {
    async fn insert(&self, n: &Notification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications
                (id, tenant_id, channel, status, priority, recipient, template_id,
                 context, attempt_count, vendor_preference, batch_id, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(n.id)
        .bind(&n.tenant_id)
        .bind(n.channel.as_str())
        .bind(n.status.as_str())
        .bind(n.priority.as_str())
        .bind(&n.recipient)
        .bind(n.template_id)
        .bind(serde_json::to_string(&n.context)?)
        .bind(n.attempt_count)
        .bind(&n.vendor_preference)
        .bind(&n.batch_id)
        .bind(serde_json::to_string(&n.metadata)?)
        .bind(n.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>> {
        let row = sqlx::query("SELECT * FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_notification).transpose()
    }

    async fn mark_queued(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE notifications SET status = 'queued', queued_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.status_cache.invalidate(id);
        Ok(())
    }

    async fn mark_processing(&self, id: Uuid) -> Result<Option<Notification>> {
        let row = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'processing',
                processing_started_at = COALESCE(processing_started_at, $2)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        self.status_cache.invalidate(id);
        row.as_ref().map(row_to_notification).transpose()
    }

    async fn record_attempt(
        &self,
        id: Uuid,
        attempt: &DeliveryAttempt,
        new_status: NotificationStatus,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent workers on the same notification
        let locked = sqlx::query("SELECT id FROM notifications WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO delivery_attempts
                (id, notification_id, vendor, status, response, error, attempted_at, duration_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.notification_id)
        .bind(&attempt.vendor)
        .bind(attempt.status.as_str())
        .bind(serde_json::to_string(&attempt.response)?)
        .bind(&attempt.error)
        .bind(attempt.attempted_at)
        .bind(attempt.duration_ms as i64)
        .execute(&mut *tx)
        .await?;

        let completed_at: Option<DateTime<Utc>> = match new_status {
            NotificationStatus::Delivered | NotificationStatus::Failed => Some(Utc::now()),
            _ => None,
        };

        sqlx::query(
            r#"
            UPDATE notifications
            SET status = $2,
                attempt_count = attempt_count + 1,
                completed_at = COALESCE($3, completed_at)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(new_status.as_str())
        .bind(completed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.status_cache.invalidate(id);
        Ok(())
    }

    async fn transition(&self, id: Uuid, status: NotificationStatus) -> Result<()> {
        let completed_at: Option<DateTime<Utc>> = match status {
            NotificationStatus::Delivered | NotificationStatus::Failed => Some(Utc::now()),
            _ => None,
        };

        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $2,
                completed_at = COALESCE(completed_at, $3)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.status_cache.invalidate(id);
        Ok(())
    }

    async fn get_attempts(&self, id: Uuid) -> Result<Vec<DeliveryAttempt>> {
        let rows = sqlx::query(
            "SELECT * FROM delivery_attempts WHERE notification_id = $1 ORDER BY attempted_at",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_attempt).collect()
    }

    async fn attempted_vendors(&self, id: Uuid) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT vendor FROM delivery_attempts WHERE notification_id = $1 ORDER BY attempted_at",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut vendors: Vec<String> = Vec::new();
        for row in rows {
            let vendor: String = row.try_get("vendor")?;
            if !vendors.contains(&vendor) {
                vendors.push(vendor);
            }
        }
        Ok(vendors)
    }

    async fn list_by_batch(&self, tenant_id: &str, batch_id: &str) -> Result<Vec<Notification>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM notifications
            WHERE tenant_id = $1 AND batch_id = $2
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_notification).collect()
    }

    async fn get_status(&self, id: Uuid) -> Result<Option<NotificationSummary>> {
        if let Some(cached) = self.status_cache.get(id) {
            return Ok(Some(cached));
        }

        let Some(notification) = NotificationStore::get(self, id).await? else {
            return Ok(None);
        };
        let attempts = self.get_attempts(id).await?;
        let summary = NotificationSummary::build(&notification, &attempts);
        self.status_cache.put(summary.clone());
        Ok(Some(summary))
    }
}

#[async_trait]
impl TemplateStore for PgStore {
    async fn get(&self, id: Uuid) -> Result<Option<Template>> {
        let row = sqlx::query("SELECT * FROM templates WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_template).transpose()
    }

    async fn find_by_name(&self, tenant_id: &str, name: &str) -> Result<Option<Template>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM templates
            WHERE tenant_id = $1 AND name = $2 AND active = TRUE
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_template).transpose()
    }

    async fn create(&self, template: &Template) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO templates
                (id, tenant_id, name, channel, version, active, content, vendor_metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(template.id)
        .bind(&template.tenant_id)
        .bind(&template.name)
        .bind(template.channel.as_str())
        .bind(template.version)
        .bind(template.active)
        .bind(serde_json::to_string(&template.content)?)
        .bind(serde_json::to_string(&template.vendor_metadata)?)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(
        &self,
        tenant_id: &str,
        name: &str,
        expected_version: i32,
        content: TemplateContent,
        vendor_metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Template> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT version FROM templates
            WHERE tenant_id = $1 AND name = $2
            ORDER BY version DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        let current_version: i32 = match row {
            Some(row) => row.try_get("version")?,
            None => return Err(StoreError::NotFound(name.to_string())),
        };

        if current_version != expected_version {
            return Err(StoreError::VersionConflict {
                name: name.to_string(),
                expected: expected_version,
            });
        }

        sqlx::query("UPDATE templates SET active = FALSE WHERE tenant_id = $1 AND name = $2")
            .bind(tenant_id)
            .bind(name)
            .execute(&mut *tx)
            .await?;

        let template = Template {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            channel: content.channel(),
            version: expected_version + 1,
            active: true,
            content,
            vendor_metadata,
            created_at: Utc::now(),
            updated_at: Some(Utc::now()),
        };

        sqlx::query(
            r#"
            INSERT INTO templates
                (id, tenant_id, name, channel, version, active, content, vendor_metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(template.id)
        .bind(&template.tenant_id)
        .bind(&template.name)
        .bind(template.channel.as_str())
        .bind(template.version)
        .bind(template.active)
        .bind(serde_json::to_string(&template.content)?)
        .bind(serde_json::to_string(&template.vendor_metadata)?)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(template)
    }
}

#[async_trait]
impl VendorStatusStore for PgStore {
    async fn upsert(&self, status: &VendorStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vendor_status (vendor, channel, tenant_id, state, success_rate, last_check)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (vendor, channel, tenant_id)
            DO UPDATE SET state = $4, success_rate = $5, last_check = $6
            "#,
        )
        .bind(&status.vendor)
        .bind(status.channel.as_str())
        .bind(&status.tenant_id)
        .bind(status.state.as_str())
        .bind(status.success_rate)
        .bind(status.last_check)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(
        &self,
        vendor: &str,
        channel: Channel,
        tenant_id: &str,
    ) -> Result<Option<VendorStatus>> {
        let row = sqlx::query(
            "SELECT * FROM vendor_status WHERE vendor = $1 AND channel = $2 AND tenant_id = $3",
        )
        .bind(vendor)
        .bind(channel.as_str())
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_vendor_status).transpose()
    }

    async fn list(&self, channel: Channel, tenant_id: &str) -> Result<Vec<VendorStatus>> {
        let rows = sqlx::query(
            "SELECT * FROM vendor_status WHERE channel = $1 AND tenant_id = $2",
        )
        .bind(channel.as_str())
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_vendor_status).collect()
    }
}
