//! Webhook delivery over HTTP
//!
//! Posts JSON callbacks and signs the body with HMAC-SHA256 when a secret is
//! configured. Retries are not handled here: a failed post fails the outbox
//! row, and the sweeper re-drives it.

use anyhow::Context;
use async_trait::async_trait;
use fileflow_core::{AppError, AppResult, WebhookNotifier};
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Fileflow-Signature";
pub const EVENT_HEADER: &str = "X-Fileflow-Event";

/// Configuration for webhook delivery
#[derive(Clone)]
pub struct WebhookConfig {
    pub timeout_seconds: u64,
    pub signing_secret: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
            signing_secret: None,
        }
    }
}

#[derive(Clone)]
pub struct ReqwestWebhookNotifier {
    http_client: Client,
    signing_secret: Option<String>,
}

impl ReqwestWebhookNotifier {
    pub fn new(config: WebhookConfig) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to create HTTP client for webhooks")?;

        Ok(Self {
            http_client,
            signing_secret: config.signing_secret,
        })
    }

    /// Sign webhook payload with HMAC-SHA256
    pub fn sign_payload(body: &str, secret: &str) -> AppResult<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| AppError::Internal(format!("Invalid signing secret: {}", e)))?;
        mac.update(body.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl WebhookNotifier for ReqwestWebhookNotifier {
    #[tracing::instrument(skip(self, payload), fields(url = %url, event = %event))]
    async fn post(&self, url: &str, event: &str, payload: &serde_json::Value) -> AppResult<()> {
        let body = serde_json::to_string(payload)?;
        let start = std::time::Instant::now();

        let mut request = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", "Fileflow-Webhook/1.0")
            .header(EVENT_HEADER, event);

        if let Some(secret) = &self.signing_secret {
            let signature = Self::sign_payload(&body, secret)?;
            request = request.header(SIGNATURE_HEADER, format!("sha256={}", signature));
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::external("webhook", e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(
                status = status.as_u16(),
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "Webhook delivered"
            );
            return Ok(());
        }

        let response_body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("Failed to read response body"));
        Err(AppError::external(
            "webhook",
            format!(
                "Webhook returned non-2xx status: {} - {}",
                status.as_u16(),
                response_body
            ),
        ))
    }
}
