//! Outbound usage-event webhook delivery (spec.md §6 "Webhook emission").
//!
//! Signing follows the teacher's `webhook_security_service.rs` convention
//! (`X-Webhook-Signature: sha256=<hex HMAC-SHA256 of body>`), but this is
//! the *sending* side — verifying inbound webhooks is out of scope.

use crate::core::decision::UsageEvent;
use crate::core::hooks::UsageObserver;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub secret: Option<String>,
    pub max_attempts: u32,
    pub max_body_bytes: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { url: None, secret: None, max_attempts: 5, max_body_bytes: DEFAULT_MAX_BODY_BYTES }
    }
}

pub struct WebhookDispatcher {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig) -> Self {
        Self { client: reqwest::Client::new(), config }
    }

    pub fn is_configured(&self) -> bool {
        self.config.url.is_some()
    }

    fn sign(&self, body: &[u8]) -> Option<String> {
        let secret = self.config.secret.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
        mac.update(body);
        Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
    }

    /// Delivers `event` with exponential backoff, up to `max_attempts`.
    /// Failures are logged and swallowed per spec.md §7 — a broken
    /// downstream must never deny live traffic.
    pub async fn deliver(self: Arc<Self>, event: UsageEvent) {
        let Some(url) = self.config.url.clone() else { return };

        let mut body = match serde_json::to_vec(&event) {
            Ok(b) => b,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize usage event for webhook");
                return;
            }
        };
        if body.len() > self.config.max_body_bytes {
            body.truncate(self.config.max_body_bytes);
        }

        let signature = self.sign(&body);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut request = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .body(body.clone());
            if let Some(sig) = &signature {
                request = request.header("X-Webhook-Signature", sig.clone());
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => {
                    tracing::warn!(status = %resp.status(), attempt, "webhook delivery rejected");
                }
                Err(err) => {
                    tracing::warn!(error = %err, attempt, "webhook delivery failed");
                }
            }

            if attempt >= self.config.max_attempts {
                tracing::error!(attempt, "webhook delivery abandoned after max attempts");
                return;
            }
            let backoff = Duration::from_millis(100 * 2u64.pow(attempt.min(10)));
            tokio::time::sleep(backoff).await;
        }
    }
}

/// Bridges the gate's synchronous observer hook to async webhook delivery
/// (spec.md §6 "on every usage event, if a URL is configured: POST...").
/// Spawns delivery rather than awaiting it, since `on_usage_event` runs
/// inline on the decision path and must never block a caller's request.
pub struct WebhookObserver {
    dispatcher: Arc<WebhookDispatcher>,
}

impl WebhookObserver {
    pub fn new(dispatcher: Arc<WebhookDispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl UsageObserver for WebhookObserver {
    fn on_usage_event(&self, event: &UsageEvent) {
        tracing::debug!(
            tool = %event.tool,
            allowed = event.allowed,
            credits_charged = event.credits_charged,
            "usage event"
        );

        if !self.dispatcher.is_configured() {
            return;
        }
        let dispatcher = self.dispatcher.clone();
        let event = event.clone();
        tokio::spawn(async move { dispatcher.deliver(event).await });
    }

    fn on_credits_deducted(&self, key: &str, amount: i64) {
        tracing::debug!(key = %crate::utils::sanitize_for_log(key), amount, "credits deducted");
    }

    fn on_auto_topup(&self, key: &str, amount: i64, new_balance: i64) {
        tracing::info!(
            key = %crate::utils::sanitize_for_log(key),
            amount,
            new_balance,
            "auto-topup applied"
        );
    }
}
