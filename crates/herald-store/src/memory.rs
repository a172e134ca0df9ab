//! In-memory store backend for development mode and tests.
//!
//! Transition semantics mirror the Postgres backend: per-notification
//! exclusive access plays the role of the row lock, and `record_attempt`
//! applies the attempt append and the status transition together.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use herald_common::{
    Channel, DeliveryAttempt, Notification, NotificationStatus, Template, TemplateContent,
    VendorStatus,
};

use crate::{
    NotificationStore, NotificationSummary, Result, StatusCache, StoreError, TemplateStore,
    VendorStatusStore,
};

pub struct InMemoryStore {
    notifications: DashMap<Uuid, Notification>,
    attempts: DashMap<Uuid, Vec<DeliveryAttempt>>,
    templates: RwLock<Vec<Template>>,
    vendor_status: DashMap<(String, String, String), VendorStatus>,
    status_cache: StatusCache,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            notifications: DashMap::new(),
            attempts: DashMap::new(),
            templates: RwLock::new(Vec::new()),
            vendor_status: DashMap::new(),
            status_cache: StatusCache::default(),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationStore for InMemoryStore {
    async fn insert(&self, notification: &Notification) -> Result<()> {
        self.notifications
            .insert(notification.id, notification.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>> {
        Ok(self.notifications.get(&id).map(|n| n.clone()))
    }

    async fn mark_queued(&self, id: Uuid) -> Result<()> {
        let mut entry = self
            .notifications
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        entry.status = NotificationStatus::Queued;
        entry.queued_at = Some(Utc::now());
        self.status_cache.invalidate(id);
        Ok(())
    }

    async fn mark_processing(&self, id: Uuid) -> Result<Option<Notification>> {
        let Some(mut entry) = self.notifications.get_mut(&id) else {
            return Ok(None);
        };
        entry.status = NotificationStatus::Processing;
        if entry.processing_started_at.is_none() {
            entry.processing_started_at = Some(Utc::now());
        }
        self.status_cache.invalidate(id);
        Ok(Some(entry.clone()))
    }

    async fn record_attempt(
        &self,
        id: Uuid,
        attempt: &DeliveryAttempt,
        new_status: NotificationStatus,
    ) -> Result<()> {
        let mut entry = self
            .notifications
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        self.attempts.entry(id).or_default().push(attempt.clone());

        entry.status = new_status;
        entry.attempt_count += 1;
        if matches!(
            new_status,
            NotificationStatus::Delivered | NotificationStatus::Failed
        ) {
            entry.completed_at = Some(Utc::now());
        }

        self.status_cache.invalidate(id);
        Ok(())
    }

    async fn transition(&self, id: Uuid, status: NotificationStatus) -> Result<()> {
        let mut entry = self
            .notifications
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        entry.status = status;
        if matches!(
            status,
            NotificationStatus::Delivered | NotificationStatus::Failed
        ) && entry.completed_at.is_none()
        {
            entry.completed_at = Some(Utc::now());
        }
        self.status_cache.invalidate(id);
        Ok(())
    }

    async fn get_attempts(&self, id: Uuid) -> Result<Vec<DeliveryAttempt>> {
        let mut attempts = self
            .attempts
            .get(&id)
            .map(|a| a.clone())
            .unwrap_or_default();
        attempts.sort_by_key(|a| a.attempted_at);
        Ok(attempts)
    }

    async fn attempted_vendors(&self, id: Uuid) -> Result<Vec<String>> {
        let attempts = self.get_attempts(id).await?;
        let mut vendors: Vec<String> = Vec::new();
        for attempt in attempts {
            if !vendors.contains(&attempt.vendor) {
                vendors.push(attempt.vendor);
            }
        }
        Ok(vendors)
    }

    async fn list_by_batch(&self, tenant_id: &str, batch_id: &str) -> Result<Vec<Notification>> {
        let mut matches: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|n| n.tenant_id == tenant_id && n.batch_id.as_deref() == Some(batch_id))
            .map(|n| n.clone())
            .collect();
        matches.sort_by_key(|n| n.created_at);
        Ok(matches)
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
impl TemplateStore for InMemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<Template>> {
        Ok(self.templates.read().iter().find(|t| t.id == id).cloned())
    }

    async fn find_by_name(&self, tenant_id: &str, name: &str) -> Result<Option<Template>> {
        Ok(self
            .templates
            .read()
            .iter()
            .filter(|t| t.tenant_id == tenant_id && t.name == name && t.active)
            .max_by_key(|t| t.version)
            .cloned())
    }

    async fn create(&self, template: &Template) -> Result<()> {
        let mut templates = self.templates.write();
        if templates
            .iter()
            .any(|t| t.tenant_id == template.tenant_id && t.name == template.name)
        {
            return Err(StoreError::Database(format!(
                "Template already exists: {}",
                template.name
            )));
        }
        templates.push(template.clone());
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
        let mut templates = self.templates.write();

        let current_version = templates
            .iter()
            .filter(|t| t.tenant_id == tenant_id && t.name == name)
            .map(|t| t.version)
            .max()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        if current_version != expected_version {
            return Err(StoreError::VersionConflict {
                name: name.to_string(),
                expected: expected_version,
            });
        }

        let channel = content.channel();
        for t in templates
            .iter_mut()
            .filter(|t| t.tenant_id == tenant_id && t.name == name)
        {
            t.active = false;
        }

        let new_template = Template {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            channel,
            version: expected_version + 1,
            active: true,
            content,
            vendor_metadata,
            created_at: Utc::now(),
            updated_at: Some(Utc::now()),
        };
        templates.push(new_template.clone());
        Ok(new_template)
    }
}

#[async_trait]
impl VendorStatusStore for InMemoryStore {
    async fn upsert(&self, status: &VendorStatus) -> Result<()> {
        let key = (
            status.vendor.clone(),
            status.channel.as_str().to_string(),
            status.tenant_id.clone(),
        );
        self.vendor_status.insert(key, status.clone());
        Ok(())
    }

    async fn get(
        &self,
        vendor: &str,
        channel: Channel,
        tenant_id: &str,
    ) -> Result<Option<VendorStatus>> {
        let key = (
            vendor.to_string(),
            channel.as_str().to_string(),
            tenant_id.to_string(),
        );
        Ok(self.vendor_status.get(&key).map(|s| s.clone()))
    }

    async fn list(&self, channel: Channel, tenant_id: &str) -> Result<Vec<VendorStatus>> {
        Ok(self
            .vendor_status
            .iter()
            .filter(|s| s.channel == channel && s.tenant_id == tenant_id)
            .map(|s| s.clone())
            .collect())
    }
}
