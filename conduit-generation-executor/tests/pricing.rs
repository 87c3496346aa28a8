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

use assert2::check;
use bigdecimal::BigDecimal;
use conduit_common::model::{ProviderId, ProviderOperation};
use conduit_generation_executor::model::cost::{
    RealtimeUsage, RefundRequest, Usage, UnitType,
};
use conduit_generation_executor::services::pricing::{
    PricingError, PricingService, PricingServiceDefault,
};
use conduit_generation_executor::services::rates::{
    InMemoryRateOverrideService, RateEntryStatus, RateKind, RateOverride,
};
use std::str::FromStr;
use std::sync::Arc;
use test_r::test;

fn dec(literal: &str) -> BigDecimal {
    BigDecimal::from_str(literal).unwrap()
}

fn pricing() -> (PricingServiceDefault, Arc<InMemoryRateOverrideService>) {
    let overrides = Arc::new(InMemoryRateOverrideService::new());
    (PricingServiceDefault::new(overrides.clone()), overrides)
}

fn openai() -> ProviderId {
    ProviderId::new("openai")
}

#[test]
async fn whisper_minute_pricing() {
    let (pricing, _) = pricing();

    let cost = pricing
        .cost(
            &openai(),
            ProviderOperation::Transcription,
            "whisper-1",
            &Usage::Transcription {
                duration_seconds: 60.0,
            },
        )
        .await
        .unwrap();

    check!(cost.total_cost == dec("0.006"));
    check!(cost.unit_type == UnitType::Minutes);
    check!(cost.unit_count == dec("1"));
    check!(cost.rate_per_unit == dec("0.006"));
    check!(cost.is_estimate == false);
}

#[test]
async fn builtin_tts_is_per_character() {
    let (pricing, _) = pricing();

    let cost = pricing
        .cost(
            &openai(),
            ProviderOperation::TextToSpeech,
            "tts-1",
            &Usage::TextToSpeech {
                character_count: 1000,
            },
        )
        .await
        .unwrap();

    check!(cost.unit_type == UnitType::Characters);
    check!(cost.total_cost == dec("0.015"));
}

#[test]
async fn active_override_wins_and_uses_thousand_character_units() {
    let (pricing, overrides) = pricing();
    overrides
        .put(
            openai(),
            ProviderOperation::TextToSpeech,
            "tts-1",
            RateOverride {
                kind: RateKind::PerThousandCharacters { rate: dec("10") },
                status: RateEntryStatus::Active,
            },
        )
        .await;

    let cost = pricing
        .cost(
            &openai(),
            ProviderOperation::TextToSpeech,
            "tts-1",
            &Usage::TextToSpeech {
                character_count: 2000,
            },
        )
        .await
        .unwrap();

    check!(cost.unit_type == UnitType::ThousandCharacters);
    check!(cost.unit_count == dec("2"));
    check!(cost.total_cost == dec("20"));
    check!(cost.is_estimate == false);
}

#[test]
async fn superseded_override_is_ignored() {
    let (pricing, overrides) = pricing();
    overrides
        .put(
            openai(),
            ProviderOperation::Transcription,
            "whisper-1",
            RateOverride {
                kind: RateKind::PerMinute { rate: dec("99") },
                status: RateEntryStatus::Superseded,
            },
        )
        .await;

    let cost = pricing
        .cost(
            &openai(),
            ProviderOperation::Transcription,
            "whisper-1",
            &Usage::Transcription {
                duration_seconds: 60.0,
            },
        )
        .await
        .unwrap();

    check!(cost.total_cost == dec("0.006"));
}

#[test]
async fn unknown_model_falls_back_to_estimate() {
    let (pricing, _) = pricing();

    let cost = pricing
        .cost(
            &ProviderId::new("acme"),
            ProviderOperation::Transcription,
            "acme-listen-9000",
            &Usage::Transcription {
                duration_seconds: 120.0,
            },
        )
        .await
        .unwrap();

    check!(cost.is_estimate == true);
    check!(cost.total_cost == dec("0.012"));
}

#[test]
async fn realtime_minimum_duration_floor_applies_to_positive_durations() {
    let (pricing, _) = pricing();

    let cost = pricing
        .cost(
            &openai(),
            ProviderOperation::Realtime,
            "gpt-4o-realtime-preview",
            &Usage::Realtime(RealtimeUsage {
                input_audio_seconds: 30.0,
                output_audio_seconds: 0.0,
                input_tokens: None,
                output_tokens: None,
            }),
        )
        .await
        .unwrap();

    // 30 seconds of input is floored to the one-minute minimum.
    check!(cost.total_cost == dec("0.10"));
}

#[test]
async fn realtime_breakdown_components_sum_to_total() {
    let (pricing, _) = pricing();

    let cost = pricing
        .cost(
            &openai(),
            ProviderOperation::Realtime,
            "gpt-4o-realtime-preview",
            &Usage::Realtime(RealtimeUsage {
                input_audio_seconds: 300.0,
                output_audio_seconds: 180.0,
                input_tokens: Some(1000),
                output_tokens: Some(500),
            }),
        )
        .await
        .unwrap();

    check!(cost.total_cost == dec("1.1125"));
    check!(cost.unit_type == UnitType::Composite);
    let breakdown = cost.breakdown.unwrap();
    let sum = breakdown
        .iter()
        .fold(BigDecimal::from(0), |acc, component| acc + &component.cost);
    check!(sum == cost.total_cost);
}

#[test]
async fn refund_with_breakdown() {
    let (pricing, _) = pricing();

    let refund = pricing
        .refund(RefundRequest {
            provider: openai(),
            operation: ProviderOperation::Realtime,
            model: "gpt-4o-realtime-preview".to_string(),
            reason: Some("duplicate billing".to_string()),
            original: Usage::Realtime(RealtimeUsage {
                input_audio_seconds: 300.0,
                output_audio_seconds: 180.0,
                input_tokens: Some(1000),
                output_tokens: Some(500),
            }),
            refund: Usage::Realtime(RealtimeUsage {
                input_audio_seconds: 120.0,
                output_audio_seconds: 60.0,
                input_tokens: Some(400),
                output_tokens: Some(400),
            }),
        })
        .await
        .unwrap();

    // 0.10 * 2 + 0.20 * 1 + 0.000005 * 400 + 0.000015 * 400
    check!(refund.refund_amount == dec("0.408"));
    check!(refund.refund_amount <= refund.original_cost);
    check!(refund.is_partial_refund == true);
    check!(refund.validation_messages.is_empty());
    check!(refund.reason == "duplicate billing");

    let breakdown = refund.breakdown.unwrap();
    let audio = breakdown
        .iter()
        .find(|component| component.name == "audio_refund")
        .unwrap();
    let tokens = breakdown
        .iter()
        .find(|component| component.name == "token_refund")
        .unwrap();
    check!(audio.cost == dec("0.4"));
    check!(audio.unit_count == dec("3"));
    check!(tokens.cost == dec("0.008"));
    check!(breakdown
        .iter()
        .any(|component| component.name == "input_audio"));
    check!(breakdown
        .iter()
        .any(|component| component.name == "output_tokens"));
}

#[test]
async fn refund_without_reason_is_rejected() {
    let (pricing, _) = pricing();

    let result = pricing
        .refund(RefundRequest {
            provider: openai(),
            operation: ProviderOperation::Transcription,
            model: "whisper-1".to_string(),
            reason: Some("   ".to_string()),
            original: Usage::Transcription {
                duration_seconds: 600.0,
            },
            refund: Usage::Transcription {
                duration_seconds: 60.0,
            },
        })
        .await;

    check!(matches!(result, Err(PricingError::Validation(_))));
}

#[test]
async fn refund_exceeding_original_is_clamped() {
    let (pricing, _) = pricing();

    let refund = pricing
        .refund(RefundRequest {
            provider: openai(),
            operation: ProviderOperation::Transcription,
            model: "whisper-1".to_string(),
            reason: Some("over-refund attempt".to_string()),
            original: Usage::Transcription {
                duration_seconds: 60.0,
            },
            refund: Usage::Transcription {
                duration_seconds: 600.0,
            },
        })
        .await
        .unwrap();

    check!(refund.is_partial_refund == true);
    check!(!refund.validation_messages.is_empty());
    check!(refund.refund_amount == refund.original_cost);
    check!(refund.refund_amount == dec("0.006"));
}

#[test]
async fn full_refund_is_not_partial() {
    let (pricing, _) = pricing();

    let refund = pricing
        .refund(RefundRequest {
            provider: openai(),
            operation: ProviderOperation::TextToSpeech,
            model: "tts-1".to_string(),
            reason: Some("request never served".to_string()),
            original: Usage::TextToSpeech {
                character_count: 1000,
            },
            refund: Usage::TextToSpeech {
                character_count: 1000,
            },
        })
        .await
        .unwrap();

    check!(refund.is_partial_refund == false);
    check!(refund.refund_amount == refund.original_cost);
}

#[test]
async fn mismatched_refund_usage_is_rejected() {
    let (pricing, _) = pricing();

    let result = pricing
        .refund(RefundRequest {
            provider: openai(),
            operation: ProviderOperation::Transcription,
            model: "whisper-1".to_string(),
            reason: Some("mismatch".to_string()),
            original: Usage::Transcription {
                duration_seconds: 60.0,
            },
            refund: Usage::TextToSpeech {
                character_count: 100,
            },
        })
        .await;

    check!(matches!(result, Err(PricingError::Validation(_))));
}
