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
use conduit_common::model::{ProviderId, ProviderOperation};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;

/// Parses a compiled-in decimal literal. Infallible for the literals below.
fn dec(literal: &str) -> BigDecimal {
    BigDecimal::from_str(literal).expect("valid decimal literal")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeRates {
    pub input_audio_per_minute: BigDecimal,
    pub output_audio_per_minute: BigDecimal,
    pub input_token_rate: Option<BigDecimal>,
    pub output_token_rate: Option<BigDecimal>,
    /// Positive session durations shorter than this are billed as this.
    pub minimum_duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum RateKind {
    PerMinute { rate: BigDecimal },
    PerCharacter { rate: BigDecimal },
    PerThousandCharacters { rate: BigDecimal },
    PerImage { rate: BigDecimal },
    PerVideo { rate: BigDecimal },
    Realtime(RealtimeRates),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateEntryStatus {
    Active,
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateOverride {
    pub kind: RateKind,
    pub status: RateEntryStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinRate {
    pub provider: &'static str,
    pub operation: ProviderOperation,
    pub model: &'static str,
    pub kind: RateKind,
}

lazy_static! {
    static ref BUILTIN_RATES: Vec<BuiltinRate> = vec![
        BuiltinRate {
            provider: "openai",
            operation: ProviderOperation::Transcription,
            model: "whisper-1",
            kind: RateKind::PerMinute { rate: dec("0.006") },
        },
        BuiltinRate {
            provider: "deepgram",
            operation: ProviderOperation::Transcription,
            model: "nova-2",
            kind: RateKind::PerMinute { rate: dec("0.0043") },
        },
        BuiltinRate {
            provider: "openai",
            operation: ProviderOperation::TextToSpeech,
            model: "tts-1",
            kind: RateKind::PerCharacter { rate: dec("0.000015") },
        },
        BuiltinRate {
            provider: "openai",
            operation: ProviderOperation::TextToSpeech,
            model: "tts-1-hd",
            kind: RateKind::PerCharacter { rate: dec("0.00003") },
        },
        BuiltinRate {
            provider: "elevenlabs",
            operation: ProviderOperation::TextToSpeech,
            model: "eleven_multilingual_v2",
            kind: RateKind::PerCharacter { rate: dec("0.00003") },
        },
        BuiltinRate {
            provider: "openai",
            operation: ProviderOperation::Realtime,
            model: "gpt-4o-realtime-preview",
            kind: RateKind::Realtime(RealtimeRates {
                input_audio_per_minute: dec("0.10"),
                output_audio_per_minute: dec("0.20"),
                input_token_rate: Some(dec("0.000005")),
                output_token_rate: Some(dec("0.000015")),
                minimum_duration_seconds: Some(60.0),
            }),
        },
        BuiltinRate {
            provider: "openai",
            operation: ProviderOperation::ImageGeneration,
            model: "dall-e-2",
            kind: RateKind::PerImage { rate: dec("0.02") },
        },
        BuiltinRate {
            provider: "openai",
            operation: ProviderOperation::ImageGeneration,
            model: "dall-e-3",
            kind: RateKind::PerImage { rate: dec("0.04") },
        },
        BuiltinRate {
            provider: "minimax",
            operation: ProviderOperation::VideoGeneration,
            model: "video-01",
            kind: RateKind::PerVideo { rate: dec("0.50") },
        },
    ];
}

pub fn builtin_rate(
    provider: &ProviderId,
    operation: ProviderOperation,
    model: &str,
) -> Option<RateKind> {
    BUILTIN_RATES
        .iter()
        .find(|entry| {
            entry.provider == provider.as_str()
                && entry.operation == operation
                && entry.model == model
        })
        .map(|entry| entry.kind.clone())
}

/// Last-resort rates applied when neither an override nor a built-in entry
/// matches; results computed from these are flagged as estimates.
pub fn fallback_rate(operation: ProviderOperation) -> RateKind {
    match operation {
        ProviderOperation::Transcription => RateKind::PerMinute { rate: dec("0.006") },
        ProviderOperation::TextToSpeech => RateKind::PerCharacter { rate: dec("0.000015") },
        ProviderOperation::Realtime => RateKind::Realtime(RealtimeRates {
            input_audio_per_minute: dec("0.10"),
            output_audio_per_minute: dec("0.20"),
            input_token_rate: None,
            output_token_rate: None,
            minimum_duration_seconds: None,
        }),
        ProviderOperation::ImageGeneration => RateKind::PerImage { rate: dec("0.04") },
        ProviderOperation::VideoGeneration => RateKind::PerVideo { rate: dec("0.50") },
    }
}

/// Custom rate entries from the external configuration store. Only `Active`
/// entries apply; `Superseded` ones are kept for audit but never used.
#[async_trait]
pub trait RateOverrideService: Send + Sync {
    async fn get(
        &self,
        provider: &ProviderId,
        operation: ProviderOperation,
        model: &str,
    ) -> Option<RateOverride>;
}

/// Process-local override cache; the configuration service feeds it.
#[derive(Default)]
pub struct InMemoryRateOverrideService {
    entries: RwLock<HashMap<(ProviderId, ProviderOperation, String), RateOverride>>,
}

impl InMemoryRateOverrideService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(
        &self,
        provider: ProviderId,
        operation: ProviderOperation,
        model: &str,
        entry: RateOverride,
    ) {
        let mut entries = self.entries.write().await;
        entries.insert((provider, operation, model.to_string()), entry);
    }
}

#[async_trait]
impl RateOverrideService for InMemoryRateOverrideService {
    async fn get(
        &self,
        provider: &ProviderId,
        operation: ProviderOperation,
        model: &str,
    ) -> Option<RateOverride> {
        let entries = self.entries.read().await;
        entries
            .get(&(provider.clone(), operation, model.to_string()))
            .cloned()
    }
}
