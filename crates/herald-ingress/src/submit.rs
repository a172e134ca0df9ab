//! The synchronous submission path: validate, resolve template, persist
//! pending, enqueue, mark queued.
//!
//! Submissions are idempotent when the caller supplies an idempotency key: a
//! replay inside the 24 h window returns the original notification id
//! without re-enqueueing.

use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use herald_common::{
    Channel, DispatchError, DispatchJob, Notification, NotificationStatus, Priority,
};
use herald_coord::IdempotencyStore;
use herald_queue::QueuePublisher;
use herald_store::NotificationStore;
use herald_template::TemplateService;

use crate::validate::{validate_context, validate_recipient};

#[derive(Debug, Deserialize, ToSchema)]
pub struct SubmitRequest {
    pub channel: String,
    pub recipient: String,
    /// Template name, or a template id as a UUID string.
    pub template: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub context: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub vendor_preference: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug)]
pub struct SubmitAccepted {
    pub id: Uuid,
    pub duplicate: bool,
}

pub struct SubmissionService {
    store: Arc<dyn NotificationStore>,
    templates: Arc<TemplateService>,
    idempotency: Arc<dyn IdempotencyStore>,
    publishers: HashMap<Channel, Arc<dyn QueuePublisher>>,
}

impl SubmissionService {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        templates: Arc<TemplateService>,
        idempotency: Arc<dyn IdempotencyStore>,
        publishers: HashMap<Channel, Arc<dyn QueuePublisher>>,
    ) -> Self {
        Self {
            store,
            templates,
            idempotency,
            publishers,
        }
    }

    pub async fn submit(
        &self,
        tenant_id: &str,
        request: SubmitRequest,
        idempotency_key: Option<&str>,
    ) -> Result<SubmitAccepted, DispatchError> {
        let channel = Channel::parse(&request.channel).ok_or_else(|| {
            DispatchError::InvalidPayload(format!("unrecognized channel: {}", request.channel))
        })?;

        validate_recipient(channel, &request.recipient)?;
        validate_context(&request.context)?;

        // Template must exist and be active for the submitted channel
        let template = match Uuid::parse_str(&request.template) {
            Ok(id) => self.templates.get(id).await?,
            Err(_) => self.templates.find_by_name(tenant_id, &request.template).await?,
        };
        if template.tenant_id != tenant_id {
            return Err(DispatchError::TemplateNotFound(request.template.clone()));
        }
        if !template.active {
            return Err(DispatchError::TemplateNotFound(request.template.clone()));
        }
        if template.channel != channel {
            return Err(DispatchError::InvalidPayload(format!(
                "template {} is for channel {}, not {}",
                template.name, template.channel, channel
            )));
        }

        let id = Uuid::new_v4();

        // Idempotent replay returns the original id without re-enqueueing
        if let Some(key) = idempotency_key {
            if let Some(existing) = self
                .idempotency
                .put_if_absent(tenant_id, key, id)
                .await
                .map_err(|e| DispatchError::Internal(e.to_string()))?
            {
                info!(
                    tenant_id = %tenant_id,
                    idempotency_key = %key,
                    notification_id = %existing,
                    "Duplicate submission, returning existing notification"
                );
                return Ok(SubmitAccepted {
                    id: existing,
                    duplicate: true,
                });
            }
        }

        let notification = Notification {
            id,
            tenant_id: tenant_id.to_string(),
            channel,
            status: NotificationStatus::Pending,
            priority: request.priority.unwrap_or_default(),
            recipient: request.recipient,
            template_id: template.id,
            context: request.context,
            attempt_count: 0,
            vendor_preference: request.vendor_preference,
            batch_id: request.batch_id,
            metadata: request.metadata,
            created_at: Utc::now(),
            queued_at: None,
            processing_started_at: None,
            completed_at: None,
        };

        self.store
            .insert(&notification)
            .await
            .map_err(|e| DispatchError::Internal(e.to_string()))?;

        let publisher = self.publishers.get(&channel).ok_or_else(|| {
            DispatchError::Internal(format!("No queue configured for channel {channel}"))
        })?;

        if let Err(e) = publisher.publish(DispatchJob::new(&notification)).await {
            // The pending row stays; a sweeper or resubmission can recover it
            warn!(
                notification_id = %id,
                error = %e,
                "Failed to enqueue accepted notification"
            );
            return Err(DispatchError::Internal(format!("enqueue failed: {e}")));
        }

        self.store
            .mark_queued(id)
            .await
            .map_err(|e| DispatchError::Internal(e.to_string()))?;

        info!(
            event = "notification.accepted",
            notification_id = %id,
            tenant_id = %tenant_id,
            channel = %channel,
            template = %template.name,
            "Notification accepted"
        );
        metrics::counter!("herald.notifications.accepted", "channel" => channel.as_str())
            .increment(1);

        Ok(SubmitAccepted {
            id,
            duplicate: false,
        })
    }
}
