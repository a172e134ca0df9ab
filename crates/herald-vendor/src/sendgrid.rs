//! SendGrid email adapter (REST v3, bearer auth).

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

const DEFAULT_BASE_URL: &str = "https://api.sendgrid.com";
const DEFAULT_FROM: &str = "no-reply@herald.dev";

pub struct SendGridAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    from_email: String,
}

impl SendGridAdapter {
    pub fn new(config: &VendorConfig, api_key: String) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout_ms)?,
            api_key,
            base_url: config
                .settings
                .get("base_url")
                .cloned()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            from_email: config
                .settings
                .get("from_email")
                .cloned()
                .unwrap_or_else(|| DEFAULT_FROM.to_string()),
        })
    }
}

#[async_trait]
impl VendorAdapter for SendGridAdapter {
    fn name(&self) -> &str {
        "sendgrid"
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, request: &SendRequest) -> Result<VendorReceipt> {
        let RenderedPayload::Email { subject, html, text } = &request.payload else {
            return Err(DispatchError::Internal(
                "sendgrid adapter received a non-email payload".to_string(),
            ));
        };

        let mut content = Vec::new();
        if !text.is_empty() {
            content.push(json!({"type": "text/plain", "value": text}));
        }
        if !html.is_empty() {
            content.push(json!({"type": "text/html", "value": html}));
        }

        let body = json!({
            "personalizations": [{"to": [{"email": request.recipient}]}],
            "from": {"email": self.from_email},
            "subject": subject,
            "content": content,
        });

        let response = self
            .client
            .post(format!("{}/v3/mail/send", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error("sendgrid", e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_status("sendgrid", status, retry_after, &body));
        }

        // SendGrid returns 202 with an empty body; the id lives in a header
        let message_id = response
            .headers()
            .get("X-Message-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| request.notification_id.to_string());

        Ok(VendorReceipt {
            message_id,
            status: SendStatus::Queued,
            vendor_response: json!({"status_code": status.as_u16()}),
            timestamp: Utc::now(),
        })
    }

    async fn status(&self, _message_id: &str) -> Result<MessageStatus> {
        // Per-message lookup needs the email-activity addon; report unknown
        Ok(MessageStatus::unknown())
    }

    async fn health(&self) -> VendorHealth {
        let start = Instant::now();
        let result = self
            .client
            .get(format!("{}/v3/scopes", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) if response.status().is_success() => {
                VendorHealth::healthy(latency_ms, "scopes probe ok")
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
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(base_url: &str) -> SendGridAdapter {
        let mut config = VendorConfig::default();
        config
            .settings
            .insert("base_url".to_string(), base_url.to_string());
        config
            .settings
            .insert("from_email".to_string(), "hello@acme.com".to_string());
        SendGridAdapter::new(&config, "sg-test-key".to_string()).unwrap()
    }

    fn request() -> SendRequest {
        SendRequest {
            notification_id: Uuid::new_v4(),
            tenant_id: "acme".to_string(),
            recipient: "a@b.com".to_string(),
            payload: RenderedPayload::Email {
                subject: "Welcome Ada".to_string(),
                html: "<p>Hello</p>".to_string(),
                text: "Hello".to_string(),
            },
            vendor_metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn send_returns_receipt_with_header_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/mail/send"))
            .and(header_exists("Authorization"))
            .respond_with(ResponseTemplate::new(202).insert_header("X-Message-Id", "sg-m1"))
            .mount(&server)
            .await;

        let receipt = adapter(&server.uri()).send(&request()).await.unwrap();
        assert_eq!(receipt.message_id, "sg-m1");
        assert_eq!(receipt.status, SendStatus::Queued);
    }

    #[tokio::test]
    async fn send_maps_400_to_invalid_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/mail/send"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad to"))
            .mount(&server)
            .await;

        let err = adapter(&server.uri()).send(&request()).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn send_maps_429_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/mail/send"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "17"))
            .mount(&server)
            .await;

        let err = adapter(&server.uri()).send(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::RateLimitedByVendor {
                retry_after_secs: Some(17),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn send_maps_503_to_vendor_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/mail/send"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = adapter(&server.uri()).send(&request()).await.unwrap_err();
        assert!(matches!(err, DispatchError::VendorUnavailable { .. }));
    }

    #[tokio::test]
    async fn health_reports_latency() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/scopes"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let health = adapter(&server.uri()).health().await;
        assert!(health.healthy);
        assert!(health.last_error.is_none());
    }
}
