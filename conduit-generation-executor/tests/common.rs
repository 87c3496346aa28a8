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

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use conduit_common::model::{ProviderId, ProviderOperation, VirtualKeyId};
use conduit_generation_executor::bootstrap::Services;
use conduit_generation_executor::config::GenerationExecutorConfig;
use conduit_generation_executor::model::cost::RealtimeUsage;
use conduit_generation_executor::model::event::EventEnvelope;
use conduit_generation_executor::services::events::EventSubscription;
use conduit_generation_executor::services::media::InMemoryMediaStore;
use conduit_generation_executor::services::providers::{
    MediaPayload, ProviderClient, ProviderDescriptor, ProviderError, RealtimeSessionRequest,
    RealtimeSessionResult, StaticProviderRegistry, TranscriptionRequest, TranscriptionResult,
    VideoRequest, VideoResult,
};
use conduit_generation_executor::services::virtual_key::InMemoryVirtualKeyService;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_VIRTUAL_KEY: &str = "vk-test";

/// Tightened timings so retry and orphan paths run in milliseconds.
pub fn fast_config() -> GenerationExecutorConfig {
    let mut config = GenerationExecutorConfig::default();
    config.queue.claim_ttl = Duration::from_secs(60);
    config.queue.default_retry_delay = Duration::from_millis(10);
    config.queue.orphan_retry_delay = Duration::from_millis(5);
    config.orchestrator.retry_backoff_base = Duration::from_millis(10);
    config.orchestrator.retry_backoff_cap = Duration::from_millis(50);
    config.orchestrator.retry_jitter_factor = 0.0;
    config.orchestrator.provider_call_timeout = Duration::from_secs(5);
    config.orchestrator.image_download_timeout = Duration::from_millis(500);
    config.orchestrator.video_download_timeout = Duration::from_millis(500);
    config
}

pub struct TestEnvironment {
    pub services: Services,
    pub media_store: Arc<InMemoryMediaStore>,
    pub virtual_keys: Arc<InMemoryVirtualKeyService>,
}

pub fn environment(registry: StaticProviderRegistry) -> TestEnvironment {
    environment_with_config(registry, fast_config())
}

pub fn environment_with_config(
    registry: StaticProviderRegistry,
    config: GenerationExecutorConfig,
) -> TestEnvironment {
    let media_store = Arc::new(InMemoryMediaStore::new("memory://media"));
    let virtual_keys = Arc::new(InMemoryVirtualKeyService::new());
    virtual_keys.set_balance(
        VirtualKeyId::new(TEST_VIRTUAL_KEY),
        BigDecimal::from_str("10").unwrap(),
    );
    let services = Services::in_memory(
        &config,
        Arc::new(registry),
        media_store.clone(),
        virtual_keys.clone(),
    )
    .expect("in-memory services");
    TestEnvironment {
        services,
        media_store,
        virtual_keys,
    }
}

/// Drains the subscription until it stays quiet for `idle`, counting how
/// often each topic was observed.
pub async fn drain_topic_counts(
    subscription: &mut EventSubscription,
    idle: Duration,
) -> std::collections::HashMap<String, usize> {
    let mut counts = std::collections::HashMap::new();
    while let Ok(Some(envelope)) = tokio::time::timeout(idle, subscription.recv()).await {
        *counts.entry(envelope.event.topic().to_string()).or_insert(0) += 1;
    }
    counts
}

/// Drains events until the given topic arrives or the timeout elapses.
pub async fn wait_for_topic(
    subscription: &mut EventSubscription,
    topic: &str,
) -> Option<EventEnvelope> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, subscription.recv()).await {
            Ok(Some(envelope)) if envelope.event.topic() == topic => return Some(envelope),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

/// Transcription adapter that fails transiently a fixed number of times
/// before succeeding, optionally holding each call open for a while so
/// duplicate executions can overlap.
pub struct FlakyTranscriptionProvider {
    remaining_failures: AtomicU32,
    delay: Duration,
}

impl FlakyTranscriptionProvider {
    pub fn new(failures: u32) -> Self {
        Self::with_delay(failures, Duration::ZERO)
    }

    pub fn with_delay(failures: u32, delay: Duration) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            delay,
        }
    }
}

#[async_trait]
impl ProviderClient for FlakyTranscriptionProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: ProviderId::new("openai"),
            capabilities: HashSet::from([ProviderOperation::Transcription]),
            model_categories: HashSet::from(["whisper".to_string()]),
        }
    }

    async fn transcribe(
        &self,
        _request: TranscriptionRequest,
    ) -> Result<TranscriptionResult, ProviderError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Transient("upstream returned 503".to_string()));
        }
        Ok(TranscriptionResult {
            text: "hello world".to_string(),
            detected_language: Some("en".to_string()),
            confidence: Some(0.97),
            duration_seconds: 60.0,
        })
    }
}

/// Video adapter returning a fixed media payload.
pub struct ScriptedVideoProvider {
    id: &'static str,
    payload: MediaPayload,
}

impl ScriptedVideoProvider {
    pub fn new(id: &'static str, payload: MediaPayload) -> Self {
        Self { id, payload }
    }
}

#[async_trait]
impl ProviderClient for ScriptedVideoProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: ProviderId::new(self.id),
            capabilities: HashSet::from([ProviderOperation::VideoGeneration]),
            model_categories: HashSet::from(["sora".to_string()]),
        }
    }

    async fn generate_video(&self, _request: VideoRequest) -> Result<VideoResult, ProviderError> {
        Ok(VideoResult {
            video: self.payload.clone(),
            generation_duration_seconds: 42.5,
        })
    }
}

/// Realtime adapter with fixed usage numbers.
pub struct ScriptedRealtimeProvider;

#[async_trait]
impl ProviderClient for ScriptedRealtimeProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: ProviderId::new("openai"),
            capabilities: HashSet::from([ProviderOperation::Realtime]),
            model_categories: HashSet::from(["gpt".to_string()]),
        }
    }

    async fn open_realtime(
        &self,
        _request: RealtimeSessionRequest,
    ) -> Result<RealtimeSessionResult, ProviderError> {
        Ok(RealtimeSessionResult {
            session_id: "sess-1".to_string(),
            usage: RealtimeUsage {
                input_audio_seconds: 300.0,
                output_audio_seconds: 180.0,
                input_tokens: Some(1000),
                output_tokens: Some(500),
            },
        })
    }
}
