//! Escalation notices delivered to an outbound webhook.
//!
//! Each POST carries the notice as JSON. When a secret is configured the body
//! is signed and the signature sent as `x-expensa-signature: sha256=<hex>`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tracing::{info, warn};

use expensa_core::config::NotificationsConfig;
use expensa_core::notify::{EscalationNotice, EscalationNotifier, NotifyError, TracingNotifier};

pub const SIGNATURE_HEADER: &str = "x-expensa-signature";

type HmacSha256 = Hmac<Sha256>;

pub struct WebhookNotifier {
    client: Client,
    url: String,
    secret: Option<SecretString>,
}

impl WebhookNotifier {
    pub fn new(
        url: impl Into<String>,
        secret: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| NotifyError::Configuration(error.to_string()))?;
        Ok(Self { client, url: url.into(), secret })
    }
}

#[async_trait]
impl EscalationNotifier for WebhookNotifier {
    async fn notify(&self, notice: &EscalationNotice) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(notice)
            .map_err(|error| NotifyError::Delivery(format!("encode notice: {error}")))?;

        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.secret {
            let signature = sign(secret.expose_secret().as_bytes(), &body)?;
            request = request.header(SIGNATURE_HEADER, format!("sha256={signature}"));
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|error| NotifyError::Delivery(error.to_string()))?;

        if !response.status().is_success() {
            warn!(
                event_name = "workflow.sla.webhook_rejected",
                report_id = %notice.report_id,
                status = %response.status(),
                "escalation webhook returned non-success status"
            );
            return Err(NotifyError::Delivery(format!(
                "webhook returned {}",
                response.status()
            )));
        }

        info!(
            event_name = "workflow.sla.webhook_delivered",
            report_id = %notice.report_id,
            step_number = notice.step_number,
            mark_hours = notice.mark_hours,
            "escalation webhook delivered"
        );
        Ok(())
    }
}

/// Webhook delivery when a URL is configured, log-only otherwise.
pub fn notifier_from_config(
    config: &NotificationsConfig,
) -> Result<Arc<dyn EscalationNotifier>, NotifyError> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(WebhookNotifier::new(
            url.clone(),
            config.webhook_secret.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)),
        None => Ok(Arc::new(TracingNotifier)),
    }
}

fn sign(secret: &[u8], payload: &[u8]) -> Result<String, NotifyError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|error| NotifyError::Configuration(error.to_string()))?;
    mac.update(payload);
    Ok(encode_hex(mac.finalize().into_bytes().as_slice()))
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
