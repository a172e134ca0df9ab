//! Amazon SNS push adapter.
//!
//! Recipients are platform-endpoint ARNs; auth is SigV4 via the default AWS
//! credential chain.

use async_trait::async_trait;
use aws_sdk_sns::Client;
use aws_sdk_sns::error::ProvideErrorMetadata;
use chrono::Utc;
use serde_json::json;
use std::time::Instant;

use herald_common::{Channel, DispatchError, RenderedPayload};
use herald_config::VendorConfig;

use crate::{
    MessageStatus, Result, SendRequest, SendStatus, VendorAdapter, VendorHealth, VendorReceipt,
};

pub struct SnsAdapter {
    client: Client,
}

impl SnsAdapter {
    pub async fn new(_config: &VendorConfig) -> Self {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: Client::new(&aws_config),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

/// SNS message body for a platform endpoint: a default rendering plus the
/// per-platform JSON payloads.
pub fn build_push_message(title: &str, body: &str, data: &std::collections::HashMap<String, String>) -> String {
    let gcm = json!({
        "notification": {"title": title, "body": body},
        "data": data,
    })
    .to_string();
    let apns = json!({
        "aps": {"alert": {"title": title, "body": body}},
        "data": data,
    })
    .to_string();

    json!({
        "default": body,
        "GCM": gcm,
        "APNS": apns,
    })
    .to_string()
}

#[async_trait]
impl VendorAdapter for SnsAdapter {
    fn name(&self) -> &str {
        "sns"
    }

    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, request: &SendRequest) -> Result<VendorReceipt> {
        let RenderedPayload::Push { title, body, data } = &request.payload else {
            return Err(DispatchError::Internal(
                "sns adapter received a non-push payload".to_string(),
            ));
        };

        let message = build_push_message(title, body, data);

        let result = self
            .client
            .publish()
            .target_arn(&request.recipient)
            .message(message)
            .message_structure("json")
            .send()
            .await;

        match result {
            Ok(output) => Ok(VendorReceipt {
                message_id: output
                    .message_id()
                    .map(str::to_string)
                    .unwrap_or_else(|| request.notification_id.to_string()),
                status: SendStatus::Sent,
                vendor_response: json!({"message_id": output.message_id()}),
                timestamp: Utc::now(),
            }),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_invalid_parameter_exception()
                    || service_error.is_endpoint_disabled_exception()
                {
                    Err(DispatchError::InvalidPayload(format!(
                        "sns rejected publish: {service_error}"
                    )))
                } else if service_error.code() == Some("ThrottledException") {
                    Err(DispatchError::RateLimitedByVendor {
                        vendor: "sns".to_string(),
                        retry_after_secs: None,
                    })
                } else {
                    Err(DispatchError::VendorUnavailable {
                        vendor: "sns".to_string(),
                        reason: service_error.to_string(),
                    })
                }
            }
        }
    }

    async fn status(&self, _message_id: &str) -> Result<MessageStatus> {
        // SNS has no per-message lookup; delivery status arrives via
        // CloudWatch delivery logging
        Ok(MessageStatus::unknown())
    }

    async fn health(&self) -> VendorHealth {
        let start = Instant::now();
        let result = self.client.list_platform_applications().send().await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(_) => VendorHealth::healthy(latency_ms, "platform applications probe ok"),
            Err(e) => VendorHealth::unhealthy(latency_ms, e.to_string()),
        }
    }
}
