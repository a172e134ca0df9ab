//! Amazon SES email adapter, speaking the SES SMTP interface.
//!
//! Credentials are SES SMTP credentials in `user:password` form; the
//! configured `smtp_host` selects the regional endpoint.

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use std::time::{Duration, Instant};

use herald_common::{Channel, DispatchError, RenderedPayload};
use herald_config::VendorConfig;

use crate::{
    MessageStatus, Result, SendRequest, SendStatus, VendorAdapter, VendorHealth, VendorReceipt,
};

const DEFAULT_SMTP_HOST: &str = "email-smtp.us-east-1.amazonaws.com";
const DEFAULT_FROM: &str = "no-reply@herald.dev";

pub struct SesAdapter {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
}

impl SesAdapter {
    pub fn new(config: &VendorConfig, credential: String) -> Result<Self> {
        let (user, password) = credential.split_once(':').ok_or_else(|| {
            DispatchError::Internal(
                "ses credential must be SMTP user:password".to_string(),
            )
        })?;

        let host = config
            .settings
            .get("smtp_host")
            .map(String::as_str)
            .unwrap_or(DEFAULT_SMTP_HOST);

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(|e| DispatchError::Internal(format!("ses transport: {e}")))?
            .credentials(Credentials::new(user.to_string(), password.to_string()))
            .timeout(Some(Duration::from_millis(config.timeout_ms)))
            .build();

        Ok(Self {
            transport,
            from_email: config
                .settings
                .get("from_email")
                .cloned()
                .unwrap_or_else(|| DEFAULT_FROM.to_string()),
        })
    }

    fn classify_smtp_error(e: lettre::transport::smtp::Error) -> DispatchError {
        if e.is_permanent() {
            // 5xx SMTP replies are rejections of this message
            DispatchError::InvalidPayload(format!("ses rejected message: {e}"))
        } else {
            DispatchError::VendorUnavailable {
                vendor: "ses".to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl VendorAdapter for SesAdapter {
    fn name(&self) -> &str {
        "ses"
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, request: &SendRequest) -> Result<VendorReceipt> {
        let RenderedPayload::Email { subject, html, text } = &request.payload else {
            return Err(DispatchError::Internal(
                "ses adapter received a non-email payload".to_string(),
            ));
        };

        let from: Mailbox = self
            .from_email
            .parse()
            .map_err(|e| DispatchError::Internal(format!("ses from address: {e}")))?;
        let to: Mailbox = request
            .recipient
            .parse()
            .map_err(|e| DispatchError::InvalidPayload(format!("recipient address: {e}")))?;

        let text_body = if text.is_empty() { " " } else { text.as_str() };
        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(subject.clone())
            .multipart(MultiPart::alternative_plain_html(
                text_body.to_string(),
                html.clone(),
            ))
            .map_err(|e| DispatchError::InvalidPayload(format!("message build: {e}")))?;

        let response = self
            .transport
            .send(email)
            .await
            .map_err(Self::classify_smtp_error)?;

        Ok(VendorReceipt {
            message_id: request.notification_id.to_string(),
            status: SendStatus::Sent,
            vendor_response: json!({"smtp_code": response.code().to_string()}),
            timestamp: Utc::now(),
        })
    }

    async fn status(&self, _message_id: &str) -> Result<MessageStatus> {
        // SES surfaces delivery state via SNS event destinations, not lookup
        Ok(MessageStatus::unknown())
    }

    async fn health(&self) -> VendorHealth {
        let start = Instant::now();
        let result = self.transport.test_connection().await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(true) => VendorHealth::healthy(latency_ms, "smtp connection ok"),
            Ok(false) => VendorHealth::unhealthy(latency_ms, "smtp connection refused"),
            Err(e) => VendorHealth::unhealthy(latency_ms, e.to_string()),
        }
    }
}
