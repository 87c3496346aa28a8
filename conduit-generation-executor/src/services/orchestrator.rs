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

//! The orchestrator (C8) drives one claimed task end to end: provider
//! selection through the resilience controller and router, the provider
//! call, media persistence, cost charging, terminal events, webhooks and
//! retry scheduling. It holds no durable state of its own; every side effect
//! is keyed by task id so at-least-once delivery stays correct.

use crate::error::GenerationError;
use crate::model::cost::{RealtimeUsage, Usage};
use crate::model::event::{EventEnvelope, LifecycleEvent, WebhookEventType};
use crate::model::task::{ClaimedItem, Task, WorkItem};
use crate::services::events::EventBus;
use crate::services::media::MediaStore;
use crate::services::pricing::PricingService;
use crate::services::progress::ProgressTracker;
use crate::services::providers::{
    model_category, ImageRequest, MediaPayload, ProviderClient, ProviderError, ProviderRegistry,
    ProviderRouter, RealtimeSessionRequest, SpeechRequest, TranscriptionRequest, VideoRequest,
};
use crate::services::quality::QualityTracker;
use crate::services::queue::WorkQueueService;
use crate::services::resilience::ResilienceService;
use crate::services::task::{CreateTaskRequest, TaskError, TaskService};
use crate::services::virtual_key::VirtualKeyService;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use conduit_common::model::{
    CorrelationId, Priority, ProviderId, ProviderOperation, TaskId, TaskState, TaskType,
    VirtualKeyId, WorkerId,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Base of the exponential retry backoff (base * 2^retry_count).
    #[serde(with = "humantime_serde")]
    pub retry_backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_backoff_cap: Duration,
    /// Uniform jitter fraction added to the computed backoff.
    pub retry_jitter_factor: f64,
    #[serde(with = "humantime_serde")]
    pub provider_call_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub video_download_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub image_download_timeout: Duration,
    /// Whether retry cycles also produce a webhook (status "retrying").
    pub notify_on_retry: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_backoff_base: Duration::from_secs(30),
            retry_backoff_cap: Duration::from_secs(10 * 60),
            retry_jitter_factor: 0.2,
            provider_call_timeout: Duration::from_secs(10 * 60),
            video_download_timeout: Duration::from_secs(15 * 60),
            image_download_timeout: Duration::from_secs(2 * 60),
            notify_on_retry: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub task_type: TaskType,
    pub virtual_key_id: VirtualKeyId,
    pub payload: serde_json::Value,
    pub priority: Option<Priority>,
    pub webhook_url: Option<String>,
    pub webhook_headers: Option<HashMap<String, String>>,
    pub correlation_id: Option<CorrelationId>,
    pub max_retries: Option<u32>,
}

/// Why execution stopped before producing a result.
enum Interruption {
    /// The client cancelled the task; observed from the task record.
    ClientCancel,
    /// This worker is shutting down; the task goes back to the queue.
    WorkerShutdown,
}

struct Invocation {
    provider: ProviderId,
    model: String,
    result: serde_json::Value,
    media: Vec<(MediaPayload, &'static str)>,
    usage: Usage,
    quality: Option<(String, f64)>,
}

pub struct Orchestrator {
    task_service: Arc<dyn TaskService>,
    queue: Arc<dyn WorkQueueService>,
    event_bus: Arc<dyn EventBus>,
    pricing: Arc<dyn PricingService>,
    resilience: Arc<dyn ResilienceService>,
    router: Arc<dyn ProviderRouter>,
    registry: Arc<dyn ProviderRegistry>,
    media_store: Arc<dyn MediaStore>,
    virtual_keys: Arc<dyn VirtualKeyService>,
    quality: Arc<QualityTracker>,
    progress: Arc<ProgressTracker>,
    http: reqwest::Client,
    config: OrchestratorConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_service: Arc<dyn TaskService>,
        queue: Arc<dyn WorkQueueService>,
        event_bus: Arc<dyn EventBus>,
        pricing: Arc<dyn PricingService>,
        resilience: Arc<dyn ResilienceService>,
        router: Arc<dyn ProviderRouter>,
        registry: Arc<dyn ProviderRegistry>,
        media_store: Arc<dyn MediaStore>,
        virtual_keys: Arc<dyn VirtualKeyService>,
        quality: Arc<QualityTracker>,
        progress: Arc<ProgressTracker>,
        config: OrchestratorConfig,
    ) -> Result<Self, GenerationError> {
        let http = reqwest::Client::builder()
            .user_agent("conduit-generation-executor")
            .build()
            .map_err(|err| GenerationError::Internal(err.to_string()))?;
        Ok(Self {
            task_service,
            queue,
            event_bus,
            pricing,
            resilience,
            router,
            registry,
            media_store,
            virtual_keys,
            quality,
            progress,
            http,
            config,
        })
    }

    async fn publish(&self, task: &Task, event: LifecycleEvent) {
        let envelope = EventEnvelope::correlated(event, task.correlation_id);
        if let Err(err) = self.event_bus.publish(envelope).await {
            warn!(task_id = %task.id, "failed to publish event: {err}");
        }
    }

    async fn request_webhook(
        &self,
        task: &Task,
        event_type: WebhookEventType,
        context: serde_json::Value,
    ) {
        if task.webhook_url.is_none() {
            return;
        }
        self.publish(
            task,
            LifecycleEvent::WebhookDeliveryRequested {
                task_id: task.id,
                event_type,
                context,
            },
        )
        .await;
    }

    /// Submit: create the durable record, enqueue the work item, publish
    /// TaskCreated. Two submissions always yield two independent lifecycles.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Task, GenerationError> {
        let task = self
            .task_service
            .create(CreateTaskRequest {
                task_type: request.task_type,
                virtual_key_id: request.virtual_key_id,
                payload: request.payload,
                webhook_url: request.webhook_url,
                webhook_headers: request.webhook_headers,
                correlation_id: request.correlation_id,
                max_retries: request.max_retries,
            })
            .await
            .map_err(task_error_to_generation)?;

        self.queue
            .enqueue(WorkItem {
                task_id: task.id,
                priority: request.priority.unwrap_or(Priority::Normal),
                virtual_key_id: task.virtual_key_id.clone(),
            })
            .await
            .map_err(|err| GenerationError::Transient(err.to_string()))?;

        self.publish(
            &task,
            LifecycleEvent::TaskCreated {
                task_id: task.id,
                task_type: task.task_type,
                virtual_key_id: task.virtual_key_id.clone(),
            },
        )
        .await;
        Ok(task)
    }

    /// Client cancel: writes the Cancelled state; the running worker observes
    /// it at its next step boundary.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<(), GenerationError> {
        let task = match self.task_service.get(task_id).await.map_err(task_error_to_generation)? {
            Some(task) => task,
            None => return Err(GenerationError::NotFound(format!("task {task_id}"))),
        };
        if task.is_terminal() {
            return Ok(());
        }
        let cancelled = self
            .task_service
            .update_state(task_id, TaskState::Cancelled, None, None)
            .await
            .map_err(task_error_to_generation)?;
        self.progress.untrack(task_id);
        self.publish(&cancelled, LifecycleEvent::TaskCancelled { task_id: *task_id })
            .await;
        self.request_webhook(&cancelled, WebhookEventType::TaskCancelled, serde_json::json!({}))
            .await;
        Ok(())
    }

    /// Moves a task to TimedOut; used when a caller's polling deadline is
    /// exceeded.
    pub async fn mark_timed_out(&self, task_id: &TaskId, reason: &str) -> Result<(), GenerationError> {
        let timed_out = self
            .task_service
            .update_state(
                task_id,
                TaskState::TimedOut,
                None,
                Some(GenerationError::TimedOut(reason.to_string()).to_public_string()),
            )
            .await
            .map_err(task_error_to_generation)?;
        self.progress.untrack(task_id);
        self.publish(
            &timed_out,
            LifecycleEvent::TaskFailed {
                task_id: *task_id,
                error: timed_out.error.clone().unwrap_or_default(),
                will_retry: false,
            },
        )
        .await;
        self.request_webhook(
            &timed_out,
            WebhookEventType::TaskFailed,
            serde_json::json!({"will_retry": false}),
        )
        .await;
        Ok(())
    }

    /// Cancellation is observed at every step boundary, before any
    /// side-effecting step.
    async fn interruption(
        &self,
        task_id: &TaskId,
        worker_lifetime: &CancellationToken,
    ) -> Option<Interruption> {
        if worker_lifetime.is_cancelled() {
            return Some(Interruption::WorkerShutdown);
        }
        match self.task_service.get(task_id).await {
            Ok(Some(task)) if task.state == TaskState::Cancelled => {
                Some(Interruption::ClientCancel)
            }
            _ => None,
        }
    }

    async fn ack_quietly(&self, task_id: &TaskId, worker_id: &WorkerId) {
        if let Err(err) = self.queue.acknowledge(task_id, worker_id).await {
            warn!(task_id = %task_id, "failed to acknowledge work item: {err}");
        }
    }

    async fn handle_interruption(
        &self,
        interruption: Interruption,
        task_id: &TaskId,
        worker_id: &WorkerId,
    ) {
        self.progress.untrack(task_id);
        match interruption {
            Interruption::ClientCancel => {
                // The Cancelled write already happened; partial uploads are
                // permitted to complete but the result is discarded.
                if let Ok(Some(task)) = self.task_service.get(task_id).await {
                    self.publish(
                        &task,
                        LifecycleEvent::ProgressTrackingCancelled { task_id: *task_id },
                    )
                    .await;
                }
                self.ack_quietly(task_id, worker_id).await;
            }
            Interruption::WorkerShutdown => {
                // Not a task-level event: release the claim and let another
                // worker pick it up immediately.
                if let Err(err) = self
                    .task_service
                    .update_state(task_id, TaskState::Pending, None, None)
                    .await
                {
                    debug!(task_id = %task_id, "shutdown state reset skipped: {err}");
                }
                if let Err(err) = self
                    .queue
                    .return_to_queue(task_id, "worker shutdown", Some(Duration::ZERO))
                    .await
                {
                    warn!(task_id = %task_id, "failed to return task on shutdown: {err}");
                }
            }
        }
    }

    fn backoff_for_retry(&self, retry_count: u32) -> Duration {
        let exponential = self
            .config
            .retry_backoff_base
            .saturating_mul(2u32.saturating_pow(retry_count));
        let capped = exponential.min(self.config.retry_backoff_cap);
        if self.config.retry_jitter_factor > 0.0 {
            let factor = rand::rng().random_range(0.0..self.config.retry_jitter_factor);
            capped + capped.mul_f64(factor)
        } else {
            capped
        }
    }

    /// Step 9: classify and either schedule a retry (state back to Pending)
    /// or fail terminally.
    async fn handle_failure(
        &self,
        task: &Task,
        error: GenerationError,
        worker_id: &WorkerId,
    ) {
        self.progress.untrack(&task.id);
        let public_error = error.to_public_string();
        let can_retry = error.is_retriable() && task.retry_count < task.max_retries;

        if can_retry {
            let backoff = self.backoff_for_retry(task.retry_count);
            let next_retry_at = Utc::now()
                + chrono::Duration::from_std(backoff)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
            let updated = match self.task_service.record_retry(&task.id, next_retry_at).await {
                Ok(updated) => updated,
                Err(err) => {
                    warn!(task_id = %task.id, "failed to record retry, failing task: {err}");
                    self.fail_terminally(task, &public_error, worker_id).await;
                    return;
                }
            };
            if let Err(err) = self
                .queue
                .return_to_queue(&task.id, &public_error, Some(backoff))
                .await
            {
                warn!(task_id = %task.id, "failed to schedule retry: {err}");
            }
            info!(
                task_id = %task.id,
                retry_count = updated.retry_count,
                backoff_ms = backoff.as_millis() as u64,
                "scheduled retry after failure: {public_error}"
            );
            self.publish(
                &updated,
                LifecycleEvent::TaskFailed {
                    task_id: task.id,
                    error: public_error.clone(),
                    will_retry: true,
                },
            )
            .await;
            if self.config.notify_on_retry {
                self.request_webhook(
                    &updated,
                    WebhookEventType::TaskFailed,
                    serde_json::json!({"will_retry": true}),
                )
                .await;
            }
        } else {
            self.fail_terminally(task, &public_error, worker_id).await;
        }
    }

    async fn fail_terminally(&self, task: &Task, public_error: &str, worker_id: &WorkerId) {
        // Exclusive for the same reason as completion: a duplicate execution
        // must not emit a second TaskFailed notification.
        let failed = match self
            .task_service
            .update_state_exclusive(
                &task.id,
                TaskState::Failed,
                None,
                Some(public_error.to_string()),
            )
            .await
        {
            Ok(failed) => failed,
            Err(TaskError::InvalidStateTransition { from, .. }) => {
                debug!(task_id = %task.id, from = %from, "task already terminal, skipping failure write");
                self.ack_quietly(&task.id, worker_id).await;
                return;
            }
            Err(err) => {
                warn!(task_id = %task.id, "failed to mark task failed: {err}");
                self.ack_quietly(&task.id, worker_id).await;
                return;
            }
        };
        self.publish(
            &failed,
            LifecycleEvent::TaskFailed {
                task_id: task.id,
                error: public_error.to_string(),
                will_retry: false,
            },
        )
        .await;
        self.request_webhook(
            &failed,
            WebhookEventType::TaskFailed,
            serde_json::json!({"will_retry": false}),
        )
        .await;
        self.ack_quietly(&task.id, worker_id).await;
    }

    /// Steps 1-8 with an error boundary around every step; every exit path
    /// releases the claim and emits the terminal event plus webhook.
    pub async fn execute(
        &self,
        claimed: ClaimedItem,
        worker_id: &WorkerId,
        worker_lifetime: &CancellationToken,
    ) {
        let task_id = claimed.item.task_id;

        // Step 1: load; absent or terminal records just release the claim.
        let task = match self.task_service.get(&task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(task_id = %task_id, "claimed task no longer exists");
                self.ack_quietly(&task_id, worker_id).await;
                return;
            }
            Err(err) => {
                warn!(task_id = %task_id, "failed to load claimed task: {err}");
                if let Err(err) = self.queue.return_to_queue(&task_id, "task load failed", None).await
                {
                    warn!(task_id = %task_id, "failed to return task: {err}");
                }
                return;
            }
        };
        if task.is_terminal() {
            self.ack_quietly(&task_id, worker_id).await;
            return;
        }

        let task = match self
            .task_service
            .update_state(&task_id, TaskState::Processing, None, None)
            .await
        {
            Ok(task) => task,
            Err(TaskError::InvalidStateTransition { .. }) => {
                self.ack_quietly(&task_id, worker_id).await;
                return;
            }
            Err(err) => {
                warn!(task_id = %task_id, "failed to mark task processing: {err}");
                if let Err(err) = self
                    .queue
                    .return_to_queue(&task_id, "state update failed", None)
                    .await
                {
                    warn!(task_id = %task_id, "failed to return task: {err}");
                }
                return;
            }
        };

        if task.task_type == TaskType::Video {
            self.progress.track(task_id);
        }

        match self.run_pipeline(&task, worker_id, worker_lifetime).await {
            Ok(()) => {}
            Err(PipelineExit::Interrupted(interruption)) => {
                self.handle_interruption(interruption, &task_id, worker_id).await;
            }
            Err(PipelineExit::Failed(error)) => {
                self.handle_failure(&task, error, worker_id).await;
            }
        }
    }

    async fn run_pipeline(
        &self,
        task: &Task,
        worker_id: &WorkerId,
        worker_lifetime: &CancellationToken,
    ) -> Result<(), PipelineExit> {
        // Step 2/3: reconstruct the request and resolve the provider.
        let invocation = self
            .invoke_provider(task, worker_lifetime)
            .await?;

        if let Some(interruption) = self.interruption(&task.id, worker_lifetime).await {
            return Err(PipelineExit::Interrupted(interruption));
        }

        // Step 5: media persistence, replacing provider URLs with ours.
        let (result, persisted) = self
            .persist_media(task, &invocation)
            .await
            .map_err(PipelineExit::Failed)?;

        if let Some(interruption) = self.interruption(&task.id, worker_lifetime).await {
            return Err(PipelineExit::Interrupted(interruption));
        }

        // Step 7: the terminal transition decides the race. The exclusive,
        // version-fenced write is won by exactly one worker; a duplicate
        // execution that loses it discards its work without charging.
        let completed = match self
            .task_service
            .update_state_exclusive(&task.id, TaskState::Completed, Some(result), None)
            .await
        {
            Ok(completed) => completed,
            Err(TaskError::InvalidStateTransition { from, .. }) => {
                debug!(task_id = %task.id, from = %from, "lost terminal transition, discarding result");
                self.progress.untrack(&task.id);
                self.ack_quietly(&task.id, worker_id).await;
                return Ok(());
            }
            Err(err) => {
                return Err(PipelineExit::Failed(GenerationError::Transient(
                    err.to_string(),
                )))
            }
        };
        self.progress.untrack(&task.id);

        // Step 6: charge only after winning the terminal transition; the
        // task id is the idempotency key for the ledger.
        match self
            .pricing
            .cost(
                &invocation.provider,
                ProviderOperation::from(task.task_type),
                &invocation.model,
                &invocation.usage,
            )
            .await
        {
            Ok(cost) => {
                self.publish(
                    &completed,
                    LifecycleEvent::ChargeSubmitted {
                        task_id: task.id,
                        virtual_key_id: task.virtual_key_id.clone(),
                        cost,
                    },
                )
                .await;
            }
            Err(err) => {
                warn!(task_id = %task.id, "cost computation failed, no charge submitted: {err}");
            }
        }

        // Step 8: terminal events and webhook.
        self.publish(&completed, LifecycleEvent::TaskCompleted { task_id: task.id })
            .await;
        for (storage_key, size_bytes) in persisted {
            self.publish(
                &completed,
                LifecycleEvent::MediaGenerationCompleted {
                    task_id: task.id,
                    storage_key,
                    size_bytes,
                },
            )
            .await;
        }
        self.request_webhook(&completed, WebhookEventType::TaskCompleted, serde_json::json!({}))
            .await;

        self.ack_quietly(&task.id, worker_id).await;
        Ok(())
    }

    /// Steps 2-4: typed request, provider resolution (router + failover),
    /// quota check, provider invocation with timeout bound to the worker
    /// lifetime.
    async fn invoke_provider(
        &self,
        task: &Task,
        worker_lifetime: &CancellationToken,
    ) -> Result<Invocation, PipelineExit> {
        let payload = task.request_payload().clone();
        let operation = ProviderOperation::from(task.task_type);

        let model = payload
            .get("model")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string();
        if model.is_empty() {
            return Err(PipelineExit::Failed(GenerationError::Validation(
                "request payload has no model".to_string(),
            )));
        }
        let category = model_category(&model);

        let provider = self
            .resolve_provider(&payload, operation, &category)
            .await
            .map_err(PipelineExit::Failed)?;
        let client = self
            .registry
            .get(&provider)
            .ok_or_else(|| {
                PipelineExit::Failed(GenerationError::ProviderDegraded(format!(
                    "provider {provider} is not registered"
                )))
            })?;

        // Pre-flight quota gate on the estimated cost.
        let estimate_usage = estimated_usage(task.task_type, &payload);
        if let Ok(estimate) = self
            .pricing
            .cost(&provider, operation, &model, &estimate_usage)
            .await
        {
            self.virtual_keys
                .authorize_spend(&task.virtual_key_id, &estimate.total_cost)
                .await
                .map_err(|err| PipelineExit::Failed(err.into()))?;
        }

        let started = Instant::now();
        let call = self.call_adapter(task, &client, &payload, &model);
        let outcome = tokio::select! {
            _ = worker_lifetime.cancelled() => {
                return Err(PipelineExit::Interrupted(Interruption::WorkerShutdown))
            }
            outcome = tokio::time::timeout(self.config.provider_call_timeout, call) => outcome,
        };
        let result = match outcome {
            Err(_) => Err(ProviderError::Transient(format!(
                "provider call exceeded {}s",
                self.config.provider_call_timeout.as_secs()
            ))),
            Ok(result) => result,
        };

        match result {
            Ok(mut invocation) => {
                self.resilience
                    .record_success(&provider, started.elapsed())
                    .await;
                if let Some((language, confidence)) = invocation.quality.take() {
                    self.quality.record(
                        &provider,
                        &model,
                        &language,
                        crate::model::quality::QualitySample {
                            confidence,
                            accuracy: confidence,
                            word_error_rate: 0.0,
                            timestamp: Utc::now(),
                        },
                    );
                }
                Ok(invocation)
            }
            Err(err) => {
                self.resilience
                    .record_failure(&provider, &err.to_string())
                    .await;
                Err(PipelineExit::Failed(err.into()))
            }
        }
    }

    /// Provider resolution: an explicitly requested provider is honored
    /// while it accepts traffic, redirecting to its active failover when
    /// quarantined; otherwise the weighted router decides.
    async fn resolve_provider(
        &self,
        payload: &serde_json::Value,
        operation: ProviderOperation,
        category: &str,
    ) -> Result<ProviderId, GenerationError> {
        if let Some(requested) = payload
            .get("provider")
            .and_then(|value| value.as_str())
            .map(ProviderId::new)
        {
            if self.resilience.accepts_traffic(&requested).await {
                return Ok(requested);
            }
            if let Some(failover) = self.resilience.active_failover(&requested).await {
                info!(from = %requested, to = %failover, "routing around quarantined provider");
                return Ok(failover);
            }
            if let Some(failover) = self
                .resilience
                .select_failover(&requested, operation, category)
                .await
            {
                return Ok(failover);
            }
            return Err(GenerationError::ProviderDegraded(format!(
                "provider {requested} is unavailable and no alternative serves {category}"
            )));
        }

        self.router
            .route(operation, category)
            .await
            .ok_or_else(|| {
                GenerationError::ProviderDegraded(format!(
                    "no available provider for {operation} in category {category}"
                ))
            })
    }

    async fn call_adapter(
        &self,
        task: &Task,
        client: &Arc<dyn ProviderClient>,
        payload: &serde_json::Value,
        model: &str,
    ) -> Result<Invocation, ProviderError> {
        let provider = client.descriptor().id;
        match task.task_type {
            TaskType::Transcription => {
                let request: TranscriptionRequest = parse_request(payload)?;
                let result = client.transcribe(request).await?;
                let quality = result.confidence.map(|confidence| {
                    (
                        result
                            .detected_language
                            .clone()
                            .unwrap_or_else(|| "unknown".to_string()),
                        confidence,
                    )
                });
                Ok(Invocation {
                    provider,
                    model: model.to_string(),
                    result: serde_json::json!({
                        "text": result.text,
                        "detected_language": result.detected_language,
                        "confidence": result.confidence,
                        "duration_seconds": result.duration_seconds,
                        "model": model,
                    }),
                    media: Vec::new(),
                    usage: Usage::Transcription {
                        duration_seconds: result.duration_seconds,
                    },
                    quality,
                })
            }
            TaskType::Tts => {
                let request: SpeechRequest = parse_request(payload)?;
                let result = client.synthesize(request).await?;
                Ok(Invocation {
                    provider,
                    model: model.to_string(),
                    result: serde_json::json!({
                        "model": model,
                        "character_count": result.character_count,
                    }),
                    media: vec![(result.audio, "audio_url")],
                    usage: Usage::TextToSpeech {
                        character_count: result.character_count,
                    },
                    quality: None,
                })
            }
            TaskType::Image => {
                let request: ImageRequest = parse_request(payload)?;
                let prompt = request.prompt.clone();
                let result = client.generate_image(request).await?;
                let count = result.images.len() as u64;
                Ok(Invocation {
                    provider,
                    model: model.to_string(),
                    result: serde_json::json!({
                        "model": model,
                        "prompt": prompt,
                    }),
                    media: result
                        .images
                        .into_iter()
                        .map(|image| (image, "image_url"))
                        .collect(),
                    usage: Usage::Media {
                        unit_count: count.max(1),
                    },
                    quality: None,
                })
            }
            TaskType::Video => {
                let request: VideoRequest = parse_request(payload)?;
                let prompt = request.prompt.clone();
                let result = client.generate_video(request).await?;
                Ok(Invocation {
                    provider,
                    model: model.to_string(),
                    result: serde_json::json!({
                        "model": model,
                        "prompt": prompt,
                        "generation_duration_seconds": result.generation_duration_seconds,
                    }),
                    media: vec![(result.video, "video_url")],
                    usage: Usage::Media { unit_count: 1 },
                    quality: None,
                })
            }
            TaskType::Realtime => {
                let request: RealtimeSessionRequest = parse_request(payload)?;
                let result = client.open_realtime(request).await?;
                let usage = result.usage.clone();
                Ok(Invocation {
                    provider,
                    model: model.to_string(),
                    result: serde_json::json!({
                        "model": model,
                        "session_id": result.session_id,
                        "input_audio_seconds": usage.input_audio_seconds,
                        "output_audio_seconds": usage.output_audio_seconds,
                    }),
                    media: Vec::new(),
                    usage: Usage::Realtime(RealtimeUsage {
                        input_audio_seconds: usage.input_audio_seconds,
                        output_audio_seconds: usage.output_audio_seconds,
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    }),
                    quality: None,
                })
            }
        }
    }

    /// Step 5: inline payloads are decoded and uploaded; external URLs are
    /// stream-downloaded with a per-type cap and re-uploaded, keeping the
    /// provider URL as a fallback when the download fails.
    async fn persist_media(
        &self,
        task: &Task,
        invocation: &Invocation,
    ) -> Result<(serde_json::Value, Vec<(String, u64)>), GenerationError> {
        let mut result = invocation.result.clone();
        let mut persisted = Vec::new();
        let mut extra_urls: Vec<String> = Vec::new();

        for (index, (payload, field)) in invocation.media.iter().enumerate() {
            let url = match payload {
                MediaPayload::Inline {
                    base64: encoded,
                    content_type,
                } => {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(encoded.as_bytes())
                        .map_err(|err| {
                            GenerationError::Fatal(format!("invalid inline media payload: {err}"))
                        })?;
                    let object = self
                        .upload(task, index, content_type, Bytes::from(bytes))
                        .await?;
                    persisted.push((object.storage_key, object.size_bytes));
                    object.url
                }
                MediaPayload::Url { url, content_type } => {
                    let timeout = match task.task_type {
                        TaskType::Video => self.config.video_download_timeout,
                        _ => self.config.image_download_timeout,
                    };
                    match self.download(url, timeout).await {
                        Ok(bytes) => {
                            let content_type = content_type
                                .as_deref()
                                .unwrap_or(default_content_type(task.task_type));
                            let object =
                                self.upload(task, index, content_type, bytes).await?;
                            persisted.push((object.storage_key, object.size_bytes));
                            object.url
                        }
                        Err(err) => {
                            // Keep the provider URL rather than failing the
                            // whole task over a transfer problem.
                            warn!(task_id = %task.id, "media download failed, keeping provider url: {err}");
                            url.clone()
                        }
                    }
                }
            };
            if let serde_json::Value::Object(object) = &mut result {
                if index == 0 {
                    object.insert(field.to_string(), serde_json::json!(url));
                } else {
                    extra_urls.push(url);
                }
            }
        }

        if !extra_urls.is_empty() {
            if let serde_json::Value::Object(object) = &mut result {
                object.insert("additional_urls".to_string(), serde_json::json!(extra_urls));
            }
        }
        Ok((result, persisted))
    }

    async fn upload(
        &self,
        task: &Task,
        index: usize,
        content_type: &str,
        bytes: Bytes,
    ) -> Result<crate::services::media::MediaObject, GenerationError> {
        let extension = extension_for(content_type);
        let key = format!("tasks/{}/output-{index}.{extension}", task.id);
        self.media_store
            .put(&key, content_type, bytes)
            .await
            .map_err(|err| GenerationError::Transient(err.to_string()))
    }

    async fn download(&self, url: &str, timeout: Duration) -> Result<Bytes, GenerationError> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| GenerationError::Transient(err.to_string()))?;
        if !response.status().is_success() {
            return Err(GenerationError::Transient(format!(
                "media download returned status {}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map_err(|err| GenerationError::Transient(err.to_string()))
    }
}

enum PipelineExit {
    Interrupted(Interruption),
    Failed(GenerationError),
}

fn parse_request<T: serde::de::DeserializeOwned>(
    payload: &serde_json::Value,
) -> Result<T, ProviderError> {
    serde_json::from_value(payload.clone())
        .map_err(|err| ProviderError::Unretryable(format!("malformed request payload: {err}")))
}

fn task_error_to_generation(error: TaskError) -> GenerationError {
    match error {
        TaskError::NotFound(task_id) => GenerationError::NotFound(format!("task {task_id}")),
        TaskError::Validation(message) => GenerationError::Validation(message),
        TaskError::InvalidStateTransition { task_id, from, to } => GenerationError::Validation(
            format!("task {task_id} cannot move from {from} to {to}"),
        ),
        TaskError::ConcurrentModification(task_id) => {
            GenerationError::Transient(format!("task {task_id} was modified concurrently"))
        }
        TaskError::Storage(err) => GenerationError::Transient(err.to_string()),
    }
}

/// Usage assumed for the pre-flight quota check, before the provider reports
/// real numbers.
fn estimated_usage(task_type: TaskType, payload: &serde_json::Value) -> Usage {
    match task_type {
        TaskType::Transcription => Usage::Transcription {
            duration_seconds: 60.0,
        },
        TaskType::Tts => Usage::TextToSpeech {
            character_count: payload
                .get("input")
                .and_then(|value| value.as_str())
                .map(|input| input.chars().count() as u64)
                .unwrap_or(1000),
        },
        TaskType::Realtime => Usage::Realtime(RealtimeUsage {
            input_audio_seconds: 60.0,
            output_audio_seconds: 60.0,
            input_tokens: None,
            output_tokens: None,
        }),
        TaskType::Image => Usage::Media {
            unit_count: payload
                .get("n")
                .and_then(|value| value.as_u64())
                .unwrap_or(1),
        },
        TaskType::Video => Usage::Media { unit_count: 1 },
    }
}

fn default_content_type(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::Video => "video/mp4",
        TaskType::Image => "image/png",
        TaskType::Tts => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "video/mp4" => "mp4",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "audio/mpeg" => "mp3",
        "audio/wav" => "wav",
        _ => "bin",
    }
}
