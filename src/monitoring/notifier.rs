use super::alerts::Alert;
use crate::error::NotifyError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the base64 HMAC-SHA256 of the request body
pub const SIGNATURE_HEADER: &str = "X-Signature";

/// External sink for dispatched alerts (e-mail, webhook, chat)
///
/// The dispatcher bounds every call with its notify timeout, so
/// implementations do not need their own deadline.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    /// Short name used in log lines
    fn name(&self) -> &str;

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Adapter running a plain closure on the blocking pool
pub struct FnNotifier {
    name: String,
    hook: Arc<dyn Fn(Alert) + Send + Sync>,
}

impl FnNotifier {
    pub fn new<F>(name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(Alert) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            hook: Arc::new(hook),
        }
    }
}

#[async_trait]
impl AlertNotifier for FnNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let hook = self.hook.clone();
        let alert = alert.clone();
        // A hook that never returns keeps a blocking thread, not the dispatcher
        tokio::task::spawn_blocking(move || hook(alert))
            .await
            .map_err(|e| NotifyError::Task(e.to_string()))
    }
}

/// Webhook settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// Shared secret used to sign request bodies
    #[serde(default)]
    pub secret: Option<String>,
}

/// Posts each alert as JSON to a configured URL
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Base64 HMAC-SHA256 of `body` under `secret`
    pub fn sign(secret: &str, body: &[u8]) -> Result<String, NotifyError> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| NotifyError::Rejected(format!("invalid webhook secret: {}", e)))?;
        mac.update(body);
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(alert)
            .map_err(|e| NotifyError::Rejected(format!("cannot encode alert: {}", e)))?;

        let mut request = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.config.secret {
            request = request.header(SIGNATURE_HEADER, Self::sign(secret, &body)?);
        }

        let response = request.body(body).send().await?;
        response.error_for_status()?;

        debug!(
            "webhook delivered alert id={} rule={}",
            alert.id, alert.rule_name
        );
        Ok(())
    }
}
