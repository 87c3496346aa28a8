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

use bigdecimal::BigDecimal;
use conduit_common::model::{ProviderId, ProviderOperation};
use serde::{Deserialize, Serialize};

/// Unit the rate in a [`CostResult`] is expressed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    Minutes,
    Characters,
    ThousandCharacters,
    Images,
    Videos,
    /// Realtime: the total is a sum of per-component products; see the
    /// breakdown for units.
    Composite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostComponent {
    pub name: String,
    pub unit_count: BigDecimal,
    pub rate_per_unit: BigDecimal,
    pub cost: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostResult {
    pub provider: ProviderId,
    pub operation: ProviderOperation,
    pub model: String,
    pub unit_count: BigDecimal,
    pub unit_type: UnitType,
    pub rate_per_unit: BigDecimal,
    pub total_cost: BigDecimal,
    pub is_estimate: bool,
    pub breakdown: Option<Vec<CostComponent>>,
}

/// Usage figures reported by a provider adapter for one finished call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Usage {
    Transcription { duration_seconds: f64 },
    TextToSpeech { character_count: u64 },
    Realtime(RealtimeUsage),
    Media { unit_count: u64 },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RealtimeUsage {
    pub input_audio_seconds: f64,
    pub output_audio_seconds: f64,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub provider: ProviderId,
    pub operation: ProviderOperation,
    pub model: String,
    /// Mandatory; a missing reason fails validation outright.
    pub reason: Option<String>,
    pub original: Usage,
    pub refund: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundResult {
    pub provider: ProviderId,
    pub operation: ProviderOperation,
    pub model: String,
    pub reason: String,
    pub original_cost: BigDecimal,
    pub refund_amount: BigDecimal,
    pub is_partial_refund: bool,
    pub validation_messages: Vec<String>,
    pub breakdown: Option<Vec<CostComponent>>,
}
