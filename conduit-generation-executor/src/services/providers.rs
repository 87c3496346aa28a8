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

//! Provider adapter seam. The wire encodings for each upstream live outside
//! this crate; adapters implement [`ProviderClient`] and register in a
//! [`ProviderRegistry`]. Selection is an explicit registry lookup plus the
//! weighted [`ProviderRouter`], never inheritance.

use crate::model::cost::{RealtimeUsage, Usage};
use async_trait::async_trait;
use conduit_common::model::{ProviderId, ProviderOperation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Transient provider failure: {0}")]
    Transient(String),
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
    #[error("Content policy violation: {0}")]
    ContentPolicy(String),
    #[error("Unretryable provider failure: {0}")]
    Unretryable(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Media produced by a provider: either inline base64 or an external URL the
/// orchestrator downloads and re-uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaPayload {
    Inline {
        base64: String,
        content_type: String,
    },
    Url {
        url: String,
        content_type: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionRequest {
    pub model: String,
    pub audio_url: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub detected_language: Option<String>,
    pub confidence: Option<f64>,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub model: String,
    pub input: String,
    pub voice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechResult {
    pub audio: MediaPayload,
    pub character_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    pub size: Option<String>,
    pub n: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResult {
    pub images: Vec<MediaPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRequest {
    pub model: String,
    pub prompt: String,
    pub duration_seconds: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoResult {
    pub video: MediaPayload,
    pub generation_duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeSessionRequest {
    pub model: String,
    pub voice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeSessionResult {
    pub session_id: String,
    pub usage: RealtimeUsage,
}

/// The typed result of one provider invocation, together with the usage the
/// cost engine charges on.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderInvocationResult {
    pub result: serde_json::Value,
    pub media: Vec<MediaPayload>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub capabilities: HashSet<ProviderOperation>,
    /// Coarse model families this provider serves (e.g. "whisper", "sora");
    /// failover stays within a family.
    pub model_categories: HashSet<String>,
}

/// The capability interface of a provider adapter. Adapters only implement
/// the operations they support; the rest report a protocol error.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn descriptor(&self) -> ProviderDescriptor;

    async fn transcribe(
        &self,
        _request: TranscriptionRequest,
    ) -> Result<TranscriptionResult, ProviderError> {
        Err(ProviderError::Protocol(
            "transcription is not supported by this provider".to_string(),
        ))
    }

    async fn synthesize(&self, _request: SpeechRequest) -> Result<SpeechResult, ProviderError> {
        Err(ProviderError::Protocol(
            "speech synthesis is not supported by this provider".to_string(),
        ))
    }

    async fn generate_image(&self, _request: ImageRequest) -> Result<ImageResult, ProviderError> {
        Err(ProviderError::Protocol(
            "image generation is not supported by this provider".to_string(),
        ))
    }

    async fn generate_video(&self, _request: VideoRequest) -> Result<VideoResult, ProviderError> {
        Err(ProviderError::Protocol(
            "video generation is not supported by this provider".to_string(),
        ))
    }

    async fn open_realtime(
        &self,
        _request: RealtimeSessionRequest,
    ) -> Result<RealtimeSessionResult, ProviderError> {
        Err(ProviderError::Protocol(
            "realtime sessions are not supported by this provider".to_string(),
        ))
    }

    /// Lightweight probe used by the recovery timer.
    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

pub trait ProviderRegistry: Send + Sync {
    fn get(&self, id: &ProviderId) -> Option<Arc<dyn ProviderClient>>;
    fn all(&self) -> Vec<Arc<dyn ProviderClient>>;
}

#[derive(Default)]
pub struct StaticProviderRegistry {
    providers: HashMap<ProviderId, Arc<dyn ProviderClient>>,
}

impl StaticProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        self.providers.insert(client.descriptor().id, client);
    }
}

impl ProviderRegistry for StaticProviderRegistry {
    fn get(&self, id: &ProviderId) -> Option<Arc<dyn ProviderClient>> {
        self.providers.get(id).cloned()
    }

    fn all(&self) -> Vec<Arc<dyn ProviderClient>> {
        self.providers.values().cloned().collect()
    }
}

/// The routing seam the resilience controller pushes weight updates through.
/// A weight of zero removes a provider from rotation.
#[async_trait]
pub trait ProviderRouter: Send + Sync {
    async fn route(
        &self,
        operation: ProviderOperation,
        model_category: &str,
    ) -> Option<ProviderId>;

    async fn set_weight(&self, provider: &ProviderId, weight: f64);

    async fn weight(&self, provider: &ProviderId) -> f64;
}

/// Reference router: picks the highest-weighted registered provider that
/// supports the requested capability and model category. Unknown providers
/// default to full weight.
pub struct WeightedProviderRouter {
    registry: Arc<dyn ProviderRegistry>,
    weights: RwLock<HashMap<ProviderId, f64>>,
}

impl WeightedProviderRouter {
    pub fn new(registry: Arc<dyn ProviderRegistry>) -> Self {
        Self {
            registry,
            weights: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ProviderRouter for WeightedProviderRouter {
    async fn route(
        &self,
        operation: ProviderOperation,
        model_category: &str,
    ) -> Option<ProviderId> {
        let weights = self.weights.read().await;
        let mut candidates: Vec<(ProviderId, f64)> = self
            .registry
            .all()
            .into_iter()
            .map(|client| client.descriptor())
            .filter(|descriptor| {
                descriptor.capabilities.contains(&operation)
                    && descriptor.model_categories.contains(model_category)
            })
            .map(|descriptor| {
                let weight = weights.get(&descriptor.id).copied().unwrap_or(1.0);
                (descriptor.id, weight)
            })
            .filter(|(_, weight)| *weight > 0.0)
            .collect();
        candidates.sort_by(|(id1, w1), (id2, w2)| {
            w2.partial_cmp(w1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(id1.cmp(id2))
        });
        candidates.into_iter().next().map(|(id, _)| id)
    }

    async fn set_weight(&self, provider: &ProviderId, weight: f64) {
        let mut weights = self.weights.write().await;
        weights.insert(provider.clone(), weight.clamp(0.0, 1.0));
    }

    async fn weight(&self, provider: &ProviderId) -> f64 {
        let weights = self.weights.read().await;
        weights.get(provider).copied().unwrap_or(1.0)
    }
}

/// Model category used for failover compatibility, derived from the model
/// name: the leading alphabetic family segment ("whisper-1" -> "whisper",
/// "gpt-4o-realtime-preview" -> "gpt").
pub fn model_category(model: &str) -> String {
    model
        .split(['-', ':', '/'])
        .next()
        .unwrap_or(model)
        .to_lowercase()
}
