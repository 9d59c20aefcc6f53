use std::sync::Arc;
use std::time::Duration;

use crate::metrics::Metrics;
use crate::models::{Agent, WebhookPayload};

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE_MILLIS: u64 = 1000;

/// Stateless HTTP POST dispatcher for webhook-delivery agents: one shared
/// `reqwest::Client`, fire-and-forget `tokio::spawn` per delivery so the
/// router is never blocked by a slow or unreachable agent endpoint.
/// Signing is a literal shared-secret header (`X-Gateway-Secret: <shared>`)
/// rather than a computed HMAC signature.
pub struct WebhookDispatcher {
    client: reqwest::Client,
}

impl Default for WebhookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .expect("failed to build webhook HTTP client");
        WebhookDispatcher { client }
    }

    /// Fire-and-forget dispatch; returns immediately, the retry loop runs
    /// on its own spawned task.
    pub fn dispatch(self: &Arc<Self>, agent: Agent, payload: WebhookPayload, metrics: Arc<Metrics>) {
        let Some(url) = agent.webhook_url.clone() else {
            return;
        };
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.deliver_with_retry(&agent, &url, &payload, &metrics).await;
        });
    }

    async fn deliver_with_retry(
        &self,
        agent: &Agent,
        url: &str,
        payload: &WebhookPayload,
        metrics: &Metrics,
    ) {
        let body = match serde_json::to_string(payload) {
            Ok(b) => b,
            Err(_) => return,
        };

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = BACKOFF_BASE_MILLIS * 2u64.pow(attempt - 1);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                metrics.record_retry();
            }

            let mut request = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .header("X-Gateway-Agent", &agent.mention_key);
            if let Some(ref secret) = agent.webhook_secret {
                request = request.header("X-Gateway-Secret", secret);
            }

            match request.body(body.clone()).send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) if resp.status().is_client_error() => {
                    eprintln!(
                        "⚠️ webhook to {} rejected (terminal): HTTP {}",
                        agent.username,
                        resp.status()
                    );
                    return;
                }
                Ok(resp) => {
                    eprintln!(
                        "⚠️ webhook to {} failed: HTTP {} (attempt {})",
                        agent.username,
                        resp.status(),
                        attempt + 1
                    );
                }
                Err(e) => {
                    eprintln!("⚠️ webhook to {} error: {e} (attempt {})", agent.username, attempt + 1);
                }
            }
        }

        eprintln!(
            "❌ webhook to {} exhausted retries, message lost (room {})",
            agent.username, payload.room
        );
        metrics.record_message_lost();
    }
}
