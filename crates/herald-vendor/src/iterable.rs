//! Iterable email adapter (REST, Api-Key header auth).

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use std::time::Instant;

use herald_common::{Channel, DispatchError, RenderedPayload};
use herald_config::VendorConfig;

use crate::http::{build_client, classify_error_status, classify_transport_error, retry_after_secs};
use crate::{
    MessageStatus, Result, SendRequest, SendStatus, VendorAdapter, VendorHealth, VendorReceipt,
};

const DEFAULT_BASE_URL: &str = "https://api.iterable.com";

pub struct IterableAdapter {
    client: Client,
    api_key: String,
    base_url: String,
}

impl IterableAdapter {
    pub fn new(config: &VendorConfig, api_key: String) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout_ms)?,
            api_key,
            base_url: config
                .settings
                .get("base_url")
                .cloned()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    /// Campaign id hint from the template's vendor metadata.
    fn campaign_id(request: &SendRequest) -> Option<i64> {
        request
            .vendor_metadata
            .get("iterable")
            .and_then(|v| v.get("campaign_id"))
            .and_then(|v| v.as_i64())
    }
}

#[async_trait]
impl VendorAdapter for IterableAdapter {
    fn name(&self) -> &str {
        "iterable"
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, request: &SendRequest) -> Result<VendorReceipt> {
        let RenderedPayload::Email { subject, html, text } = &request.payload else {
            return Err(DispatchError::Internal(
                "iterable adapter received a non-email payload".to_string(),
            ));
        };

        let mut body = json!({
            "recipientEmail": request.recipient,
            "dataFields": {
                "renderedSubject": subject,
                "renderedHtml": html,
                "renderedText": text,
            },
        });
        if let Some(campaign_id) = Self::campaign_id(request) {
            body["campaignId"] = json!(campaign_id);
        }

        let response = self
            .client
            .post(format!("{}/api/email/target", self.base_url))
            .header("Api-Key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("iterable", e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_status("iterable", status, retry_after, &body));
        }

        let body_text = response.text().await.unwrap_or_default();
        let vendor_response: serde_json::Value =
            serde_json::from_str(&body_text).unwrap_or(json!({ "raw": body_text }));

        // Iterable acknowledges without a message id; key the receipt on the
        // notification so the attempt log stays traceable
        let message_id = vendor_response
            .get("params")
            .and_then(|p| p.get("id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| request.notification_id.to_string());

        Ok(VendorReceipt {
            message_id,
            status: SendStatus::Sent,
            vendor_response,
            timestamp: Utc::now(),
        })
    }

    async fn status(&self, _message_id: &str) -> Result<MessageStatus> {
        Ok(MessageStatus::unknown())
    }

    async fn health(&self) -> VendorHealth {
        let start = Instant::now();
        let result = self
            .client
            .get(format!("{}/api/lists", self.base_url))
            .header("Api-Key", &self.api_key)
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) if response.status().is_success() => {
                VendorHealth::healthy(latency_ms, "lists probe ok")
            }
            Ok(response) => {
                VendorHealth::unhealthy(latency_ms, format!("HTTP {}", response.status().as_u16()))
            }
            Err(e) => VendorHealth::unhealthy(latency_ms, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(base_url: &str) -> IterableAdapter {
        let mut config = VendorConfig::default();
        config
            .settings
            .insert("base_url".to_string(), base_url.to_string());
        IterableAdapter::new(&config, "it-test-key".to_string()).unwrap()
    }

    fn request() -> SendRequest {
        let mut vendor_metadata = HashMap::new();
        vendor_metadata.insert("iterable".to_string(), json!({"campaign_id": 8123}));
        SendRequest {
            notification_id: Uuid::new_v4(),
            tenant_id: "acme".to_string(),
            recipient: "a@b.com".to_string(),
            payload: RenderedPayload::Email {
                subject: "Welcome".to_string(),
                html: "<p>hi</p>".to_string(),
                text: "hi".to_string(),
            },
            vendor_metadata,
        }
    }

    #[tokio::test]
    async fn send_targets_email_endpoint_with_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/email/target"))
            .and(header("Api-Key", "it-test-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"msg": "", "code": "Success", "params": {"id": "it-9"}})),
            )
            .mount(&server)
            .await;

        let receipt = adapter(&server.uri()).send(&request()).await.unwrap();
        assert_eq!(receipt.message_id, "it-9");
        assert_eq!(receipt.status, SendStatus::Sent);
    }

    #[tokio::test]
    async fn send_falls_back_to_notification_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/email/target"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"msg": "", "code": "Success"})),
            )
            .mount(&server)
            .await;

        let req = request();
        let receipt = adapter(&server.uri()).send(&req).await.unwrap();
        assert_eq!(receipt.message_id, req.notification_id.to_string());
    }

    #[tokio::test]
    async fn send_maps_500_to_vendor_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/email/target"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = adapter(&server.uri()).send(&request()).await.unwrap_err();
        assert!(matches!(err, DispatchError::VendorUnavailable { .. }));
    }
}
