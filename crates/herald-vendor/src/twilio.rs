//! Twilio SMS adapter (REST 2010 API, basic auth, form-encoded).

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

const DEFAULT_BASE_URL: &str = "https://api.twilio.com";

pub struct TwilioAdapter {
    client: Client,
    account_sid: String,
    auth_token: String,
    base_url: String,
    from_number: String,
}

impl TwilioAdapter {
    /// Credential format: `account_sid:auth_token`.
    pub fn new(config: &VendorConfig, credential: String) -> Result<Self> {
        let (account_sid, auth_token) = credential.split_once(':').ok_or_else(|| {
            DispatchError::Internal("twilio credential must be account_sid:auth_token".to_string())
        })?;

        Ok(Self {
            client: build_client(config.timeout_ms)?,
            account_sid: account_sid.to_string(),
            auth_token: auth_token.to_string(),
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

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url, self.account_sid
        )
    }
}

#[async_trait]
impl VendorAdapter for TwilioAdapter {
    fn name(&self) -> &str {
        "twilio"
    }

    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, request: &SendRequest) -> Result<VendorReceipt> {
        let RenderedPayload::Sms { body } = &request.payload else {
            return Err(DispatchError::Internal(
                "twilio adapter received a non-sms payload".to_string(),
            ));
        };

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("From", self.from_number.as_str()),
                ("To", request.recipient.as_str()),
                ("Body", body.as_str()),
            ])
            .send()
            .await
            .map_err(|e| classify_transport_error("twilio", e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_status("twilio", status, retry_after, &body));
        }

        let body_text = response.text().await.unwrap_or_default();
        let vendor_response: serde_json::Value =
            serde_json::from_str(&body_text).unwrap_or(json!({ "raw": body_text }));

        let message_id = vendor_response
            .get("sid")
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
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages/{}.json",
            self.base_url, self.account_sid, message_id
        );

        let response = self
            .client
            .get(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .map_err(|e| classify_transport_error("twilio", e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_status("twilio", status, retry_after, &body));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| classify_transport_error("twilio", e))?;

        let state = body
            .get("status")
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
        let url = format!(
            "{}/2010-04-01/Accounts/{}.json",
            self.base_url, self.account_sid
        );
        let result = self
            .client
            .get(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) if response.status().is_success() => {
                VendorHealth::healthy(latency_ms, "account probe ok")
            }
            Ok(response) => {
                VendorHealth::unhealthy(latency_ms, format!("HTTP {}", response.status().as_u16()))
            }
            Err(e) => VendorHealth::unhealthy(latency_ms, e.to_string()),
        }
    }
}
