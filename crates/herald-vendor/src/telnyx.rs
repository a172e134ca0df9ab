//! Telnyx SMS adapter (REST v2, bearer auth).

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

const DEFAULT_BASE_URL: &str = "https://api.telnyx.com";

pub struct TelnyxAdapter {
    client: Client,
    api_key: String,
    base_url: String,
    from_number: String,
}

impl TelnyxAdapter {
    pub fn new(config: &VendorConfig, api_key: String) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout_ms)?,
            api_key,
            base_url: config
                .settings
                .get("base_url")
                .cloned()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            from_number: config
                .settings
                .get("from_number")
                .cloned()
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl VendorAdapter for TelnyxAdapter {
    fn name(&self) -> &str {
        "telnyx"
    }

    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, request: &SendRequest) -> Result<VendorReceipt> {
        let RenderedPayload::Sms { body } = &request.payload else {
            return Err(DispatchError::Internal(
                "telnyx adapter received a non-sms payload".to_string(),
            ));
        };

        let response = self
            .client
            .post(format!("{}/v2/messages", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from_number,
                "to": request.recipient,
                "text": body,
            }))
            .send()
            .await
            .map_err(|e| classify_transport_error("telnyx", e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_status("telnyx", status, retry_after, &body));
        }

        let body_text = response.text().await.unwrap_or_default();
        let vendor_response: serde_json::Value =
            serde_json::from_str(&body_text).unwrap_or(json!({ "raw": body_text }));

        let message_id = vendor_response
            .get("data")
            .and_then(|d| d.get("id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| request.notification_id.to_string());

        Ok(VendorReceipt {
            message_id,
            status: SendStatus::Queued,
            vendor_response,
            timestamp: Utc::now(),
        })
    }

    async fn status(&self, message_id: &str) -> Result<MessageStatus> {
        let response = self
            .client
            .get(format!("{}/v2/messages/{}", self.base_url, message_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| classify_transport_error("telnyx", e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_status("telnyx", status, retry_after, &body));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| classify_transport_error("telnyx", e))?;

        let state = body
            .get("data")
            .and_then(|d| d.get("to"))
            .and_then(|to| to.get(0))
            .and_then(|t| t.get("status"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(MessageStatus {
            state,
            timestamps: Default::default(),
            attempts: 1,
            vendor_metadata: body,
        })
    }

    async fn health(&self) -> VendorHealth {
        let start = Instant::now();
        let result = self
            .client
            .get(format!("{}/v2/messaging_profiles", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) if response.status().is_success() => {
                VendorHealth::healthy(latency_ms, "messaging profiles probe ok")
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
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(base_url: &str) -> TelnyxAdapter {
        let mut config = VendorConfig::default();
        config
            .settings
            .insert("base_url".to_string(), base_url.to_string());
        config
            .settings
            .insert("from_number".to_string(), "+15550001111".to_string());
        TelnyxAdapter::new(&config, "tx-key".to_string()).unwrap()
    }

    fn request() -> SendRequest {
        SendRequest {
            notification_id: Uuid::new_v4(),
            tenant_id: "acme".to_string(),
            recipient: "+15551234567".to_string(),
            payload: RenderedPayload::Sms {
                body: "Your code is 1234".to_string(),
            },
            vendor_metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn send_extracts_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/messages"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "tx-m1"}})),
            )
            .mount(&server)
            .await;

        let receipt = adapter(&server.uri()).send(&request()).await.unwrap();
        assert_eq!(receipt.message_id, "tx-m1");
        assert_eq!(receipt.status, SendStatus::Queued);
    }

    #[tokio::test]
    async fn status_reads_recipient_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/messages/tx-m1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"data": {"to": [{"status": "delivered"}]}}),
            ))
            .mount(&server)
            .await;

        let status = adapter(&server.uri()).status("tx-m1").await.unwrap();
        assert_eq!(status.state, "delivered");
    }

    #[tokio::test]
    async fn send_maps_422_to_invalid_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/messages"))
            .respond_with(ResponseTemplate::new(422).set_body_string("invalid to number"))
            .mount(&server)
            .await;

        let err = adapter(&server.uri()).send(&request()).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPayload(_)));
    }
}
