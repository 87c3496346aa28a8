// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Outbound webhook delivery (C9): signed JSON notifications with caller
//! header passthrough, bounded retries on network errors and retryable
//! statuses, and a dedup key receivers can use to drop resends.

use crate::model::event::{LifecycleEvent, WebhookEventType};
use crate::model::task::Task;
use crate::services::events::EventBus;
use crate::services::task::TaskService;
use async_trait::async_trait;
use chrono::Utc;
use conduit_common::config::RetryConfig;
use conduit_common::retries::with_retries;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SIGNATURE_HEADER: &str = "x-conduit-signature";
const DEDUP_HEADER: &str = "x-conduit-delivery-key";

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Webhook delivery failed with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("Webhook delivery failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookDeliveryConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retries: RetryConfig,
    /// HMAC-SHA256 key for the signature header; unsigned when absent.
    pub signing_secret: Option<String>,
    pub user_agent: String,
}

impl Default for WebhookDeliveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: RetryConfig {
                max_attempts: 5,
                min_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
                max_jitter_factor: Some(0.2),
            },
            signing_secret: None,
            user_agent: "conduit-generation-executor".to_string(),
        }
    }
}

/// Dedup key: `{task_type}-{task_id}-{event_type}-{timestamp_slot}`, where
/// the slot is the current minute. Receivers SHOULD dedup on it; the sender
/// MAY resend.
pub fn dedup_key(task: &Task, event_type: WebhookEventType) -> String {
    let slot = Utc::now().timestamp() / 60;
    format!(
        "{}-{}-{}-{}",
        task.task_type,
        task.id,
        event_type.as_str(),
        slot
    )
}

/// Renders the notification body for an event type. Completed bodies surface
/// selected result fields (media URLs, model, prompt, durations) at the top
/// level.
pub fn render_body(
    task: &Task,
    event_type: WebhookEventType,
    context: &serde_json::Value,
) -> serde_json::Value {
    let mut body = serde_json::Map::new();
    body.insert("task_id".to_string(), serde_json::json!(task.id));

    match event_type {
        WebhookEventType::TaskCompleted => {
            body.insert("status".to_string(), serde_json::json!("completed"));
            if let Some(serde_json::Value::Object(result)) = &task.result {
                for field in [
                    "video_url",
                    "image_url",
                    "audio_url",
                    "model",
                    "prompt",
                    "text",
                    "detected_language",
                    "generation_duration_seconds",
                    "duration_seconds",
                ] {
                    if let Some(value) = result.get(field) {
                        body.insert(field.to_string(), value.clone());
                    }
                }
            }
        }
        WebhookEventType::TaskFailed => {
            let will_retry = context
                .get("will_retry")
                .and_then(|value| value.as_bool())
                .unwrap_or(false);
            body.insert(
                "status".to_string(),
                serde_json::json!(if will_retry { "retrying" } else { "failed" }),
            );
            body.insert(
                "error".to_string(),
                serde_json::json!(task.error.clone().unwrap_or_default()),
            );
        }
        WebhookEventType::TaskCancelled => {
            body.insert("status".to_string(), serde_json::json!("cancelled"));
        }
        WebhookEventType::TaskProgress => {
            body.insert("status".to_string(), serde_json::json!("processing"));
            body.insert(
                "progress_percentage".to_string(),
                serde_json::json!(task.progress),
            );
            body.insert(
                "message".to_string(),
                serde_json::json!(task.progress_message.clone().unwrap_or_default()),
            );
            if let Some(estimate) = context.get("estimated_seconds_remaining") {
                body.insert("estimated_seconds_remaining".to_string(), estimate.clone());
            }
        }
    }
    serde_json::Value::Object(body)
}

#[async_trait]
pub trait WebhookService: Send + Sync {
    /// Delivers one notification for the task, if it carries a webhook URL.
    async fn deliver(
        &self,
        task: &Task,
        event_type: WebhookEventType,
        context: &serde_json::Value,
    ) -> Result<(), WebhookError>;
}

pub struct WebhookServiceDefault {
    client: reqwest::Client,
    config: WebhookDeliveryConfig,
}

enum AttemptError {
    Network(String),
    Status(StatusCode),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Network(message) => write!(f, "network error: {message}"),
            AttemptError::Status(status) => write!(f, "status {status}"),
        }
    }
}

impl AttemptError {
    /// Network failures and 5xx are retried, as are 408 and 429; other 4xx
    /// are terminal.
    fn is_retriable(error: &AttemptError) -> bool {
        match error {
            AttemptError::Network(_) => true,
            AttemptError::Status(status) => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
        }
    }
}

impl WebhookServiceDefault {
    pub fn new(config: WebhookDeliveryConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|err| WebhookError::Failed(err.to_string()))?;
        Ok(Self { client, config })
    }

    /// Caller-supplied headers pass through after sanitization; anything that
    /// does not form a valid header is dropped with a warning.
    fn passthrough_headers(task: &Task) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(custom) = &task.webhook_headers {
            for (name, value) in custom {
                let sanitized = value.replace(['\n', '\r'], "");
                match (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(&sanitized),
                ) {
                    (Ok(name), Ok(value)) => {
                        headers.insert(name, value);
                    }
                    _ => warn!(header = %name, "dropping invalid webhook header"),
                }
            }
        }
        headers
    }

    fn signature(&self, body: &[u8]) -> Option<String> {
        let secret = self.config.signing_secret.as_ref()?;
        // HMAC accepts keys of any length; this cannot fail.
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(body);
        let digest = mac.finalize().into_bytes();
        let mut rendered = String::with_capacity(digest.len() * 2 + 7);
        rendered.push_str("sha256=");
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(&mut rendered, "{byte:02x}");
        }
        Some(rendered)
    }
}

#[async_trait]
impl WebhookService for WebhookServiceDefault {
    async fn deliver(
        &self,
        task: &Task,
        event_type: WebhookEventType,
        context: &serde_json::Value,
    ) -> Result<(), WebhookError> {
        let url = match &task.webhook_url {
            Some(url) => url.clone(),
            None => return Ok(()),
        };

        let body = render_body(task, event_type, context);
        let body_bytes =
            serde_json::to_vec(&body).map_err(|err| WebhookError::Failed(err.to_string()))?;

        let mut headers = Self::passthrough_headers(task);
        if let Ok(value) = HeaderValue::from_str(&dedup_key(task, event_type)) {
            headers.insert(HeaderName::from_static(DEDUP_HEADER), value);
        }
        if let Some(signature) = self.signature(&body_bytes) {
            if let Ok(value) = HeaderValue::from_str(&signature) {
                headers.insert(HeaderName::from_static(SIGNATURE_HEADER), value);
            }
        }

        let input = (self.client.clone(), url.clone(), headers, body_bytes);
        let result = with_retries(
            "webhook",
            "deliver",
            Some(task.id.to_string()),
            &self.config.retries,
            &input,
            |(client, url, headers, body)| {
                Box::pin(async move {
                    let response = client
                        .post(url.as_str())
                        .headers(headers.clone())
                        .header("content-type", "application/json")
                        .body(body.clone())
                        .send()
                        .await
                        .map_err(|err| AttemptError::Network(err.to_string()))?;
                    let status = response.status();
                    if status.is_success() {
                        Ok(())
                    } else {
                        Err(AttemptError::Status(status))
                    }
                })
            },
            AttemptError::is_retriable,
        )
        .await;

        match result {
            Ok(()) => {
                crate::metrics::record_webhook_delivery("delivered");
                debug!(task_id = %task.id, event_type = event_type.as_str(), "webhook delivered");
                Ok(())
            }
            Err(AttemptError::Status(status)) => {
                crate::metrics::record_webhook_delivery("rejected");
                Err(WebhookError::Rejected {
                    status: status.as_u16(),
                    message: format!("receiver rejected webhook for task {}", task.id),
                })
            }
            Err(AttemptError::Network(message)) => {
                crate::metrics::record_webhook_delivery("failed");
                Err(WebhookError::Failed(message))
            }
        }
    }
}

/// Consumes WebhookDeliveryRequested events and performs the deliveries.
/// Failures are logged; the event is not redelivered (receivers reconcile by
/// polling).
pub async fn run_webhook_consumer(
    event_bus: Arc<dyn EventBus>,
    task_service: Arc<dyn TaskService>,
    webhook_service: Arc<dyn WebhookService>,
    cancellation: CancellationToken,
) -> Result<(), anyhow::Error> {
    let mut subscription = event_bus.subscribe_topic("WebhookDeliveryRequested").await?;
    info!("webhook consumer started");
    loop {
        let envelope = tokio::select! {
            _ = cancellation.cancelled() => break,
            envelope = subscription.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };
        let LifecycleEvent::WebhookDeliveryRequested {
            task_id,
            event_type,
            context,
        } = envelope.event
        else {
            continue;
        };
        let task = match task_service.get(&task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(task_id = %task_id, "skipping webhook for evicted task");
                continue;
            }
            Err(err) => {
                warn!(task_id = %task_id, "failed to load task for webhook: {err}");
                continue;
            }
        };
        if let Err(err) = webhook_service.deliver(&task, event_type, &context).await {
            warn!(task_id = %task_id, "webhook delivery failed: {err}");
        }
    }
    info!("webhook consumer stopped");
    Ok(())
}
