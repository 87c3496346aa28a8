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

use crate::model::cost::{
    CostComponent, CostResult, RefundRequest, RefundResult, Usage, UnitType,
};
use crate::services::rates::{
    builtin_rate, fallback_rate, RateEntryStatus, RateKind, RateOverrideService, RealtimeRates,
};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, RoundingMode, Zero};
use conduit_common::model::{ProviderId, ProviderOperation};
use std::sync::Arc;

/// All currency math is fixed-point decimal; results are rounded half-up to
/// this scale.
const MONEY_SCALE: i64 = 8;

#[derive(Debug, thiserror::Error)]
pub enum PricingError {
    #[error("Validation error: {0}")]
    Validation(String),
}

fn round_money(value: BigDecimal) -> BigDecimal {
    value.with_scale_round(MONEY_SCALE, RoundingMode::HalfUp)
}

fn to_decimal(value: f64, what: &str) -> Result<BigDecimal, PricingError> {
    BigDecimal::try_from(value)
        .map_err(|_| PricingError::Validation(format!("{what} is not a finite number: {value}")))
}

fn minutes(seconds: f64, what: &str) -> Result<BigDecimal, PricingError> {
    Ok(to_decimal(seconds, what)? / BigDecimal::from(60))
}

/// Deterministic pricing and refund calculation (C4). Rate resolution order:
/// active configured override, then built-in default, then a fallback
/// estimate flagged `is_estimate`.
#[async_trait]
pub trait PricingService: Send + Sync {
    async fn cost(
        &self,
        provider: &ProviderId,
        operation: ProviderOperation,
        model: &str,
        usage: &Usage,
    ) -> Result<CostResult, PricingError>;

    async fn refund(&self, request: RefundRequest) -> Result<RefundResult, PricingError>;
}

pub struct PricingServiceDefault {
    overrides: Arc<dyn RateOverrideService>,
}

struct ResolvedRate {
    kind: RateKind,
    is_estimate: bool,
}

struct Computed {
    components: Vec<CostComponent>,
    total: BigDecimal,
    unit_count: BigDecimal,
    unit_type: UnitType,
    rate_per_unit: BigDecimal,
}

impl PricingServiceDefault {
    pub fn new(overrides: Arc<dyn RateOverrideService>) -> Self {
        Self { overrides }
    }

    async fn resolve(
        &self,
        provider: &ProviderId,
        operation: ProviderOperation,
        model: &str,
    ) -> ResolvedRate {
        if let Some(entry) = self.overrides.get(provider, operation, model).await {
            if entry.status == RateEntryStatus::Active {
                return ResolvedRate {
                    kind: entry.kind,
                    is_estimate: false,
                };
            }
        }
        if let Some(kind) = builtin_rate(provider, operation, model) {
            return ResolvedRate {
                kind,
                is_estimate: false,
            };
        }
        ResolvedRate {
            kind: fallback_rate(operation),
            is_estimate: true,
        }
    }

    fn compute(
        kind: &RateKind,
        usage: &Usage,
        apply_floor: bool,
    ) -> Result<Computed, PricingError> {
        match (kind, usage) {
            (RateKind::PerMinute { rate }, Usage::Transcription { duration_seconds }) => {
                let unit_count = minutes(*duration_seconds, "duration")?;
                Self::simple("audio", unit_count, rate.clone(), UnitType::Minutes)
            }
            (RateKind::PerCharacter { rate }, Usage::TextToSpeech { character_count }) => {
                let unit_count = BigDecimal::from(*character_count);
                Self::simple("characters", unit_count, rate.clone(), UnitType::Characters)
            }
            (
                RateKind::PerThousandCharacters { rate },
                Usage::TextToSpeech { character_count },
            ) => {
                let unit_count = BigDecimal::from(*character_count) / BigDecimal::from(1000);
                Self::simple(
                    "characters",
                    unit_count,
                    rate.clone(),
                    UnitType::ThousandCharacters,
                )
            }
            (RateKind::PerImage { rate }, Usage::Media { unit_count }) => Self::simple(
                "images",
                BigDecimal::from(*unit_count),
                rate.clone(),
                UnitType::Images,
            ),
            (RateKind::PerVideo { rate }, Usage::Media { unit_count }) => Self::simple(
                "videos",
                BigDecimal::from(*unit_count),
                rate.clone(),
                UnitType::Videos,
            ),
            (RateKind::Realtime(rates), Usage::Realtime(usage)) => {
                Self::realtime(rates, usage, apply_floor)
            }
            (kind, usage) => Err(PricingError::Validation(format!(
                "usage {usage:?} does not match the rate unit {kind:?}"
            ))),
        }
    }

    fn simple(
        name: &str,
        unit_count: BigDecimal,
        rate: BigDecimal,
        unit_type: UnitType,
    ) -> Result<Computed, PricingError> {
        let cost = round_money(&unit_count * &rate);
        Ok(Computed {
            components: vec![CostComponent {
                name: name.to_string(),
                unit_count: unit_count.clone(),
                rate_per_unit: rate.clone(),
                cost: cost.clone(),
            }],
            total: cost,
            unit_count,
            unit_type,
            rate_per_unit: rate,
        })
    }

    fn realtime(
        rates: &RealtimeRates,
        usage: &crate::model::cost::RealtimeUsage,
        apply_floor: bool,
    ) -> Result<Computed, PricingError> {
        let floor = |seconds: f64| -> f64 {
            match rates.minimum_duration_seconds {
                // The floor only applies to positive durations; refunds pass
                // through unfloored.
                Some(minimum) if apply_floor && seconds > 0.0 => seconds.max(minimum),
                _ => seconds,
            }
        };

        let input_minutes = minutes(floor(usage.input_audio_seconds), "input audio duration")?;
        let output_minutes = minutes(floor(usage.output_audio_seconds), "output audio duration")?;

        let mut components = Vec::new();
        let input_audio_cost = round_money(&input_minutes * &rates.input_audio_per_minute);
        components.push(CostComponent {
            name: "input_audio".to_string(),
            unit_count: input_minutes.clone(),
            rate_per_unit: rates.input_audio_per_minute.clone(),
            cost: input_audio_cost.clone(),
        });
        let output_audio_cost = round_money(&output_minutes * &rates.output_audio_per_minute);
        components.push(CostComponent {
            name: "output_audio".to_string(),
            unit_count: output_minutes.clone(),
            rate_per_unit: rates.output_audio_per_minute.clone(),
            cost: output_audio_cost.clone(),
        });

        let mut token_cost = BigDecimal::zero();
        if let (Some(rate), Some(tokens)) = (&rates.input_token_rate, usage.input_tokens) {
            let cost = round_money(BigDecimal::from(tokens) * rate);
            token_cost = &token_cost + &cost;
            components.push(CostComponent {
                name: "input_tokens".to_string(),
                unit_count: BigDecimal::from(tokens),
                rate_per_unit: rate.clone(),
                cost,
            });
        }
        if let (Some(rate), Some(tokens)) = (&rates.output_token_rate, usage.output_tokens) {
            let cost = round_money(BigDecimal::from(tokens) * rate);
            token_cost = &token_cost + &cost;
            components.push(CostComponent {
                name: "output_tokens".to_string(),
                unit_count: BigDecimal::from(tokens),
                rate_per_unit: rate.clone(),
                cost,
            });
        }

        let audio_cost = &input_audio_cost + &output_audio_cost;
        let total = round_money(&audio_cost + &token_cost);
        Ok(Computed {
            components,
            total,
            unit_count: &input_minutes + &output_minutes,
            unit_type: UnitType::Composite,
            rate_per_unit: BigDecimal::zero(),
        })
    }

    /// Component-wise `refund <= original`; exceeding parts are clamped with a
    /// validation message.
    fn clamp_refund(
        original: &Usage,
        refund: &Usage,
        messages: &mut Vec<String>,
    ) -> Result<(Usage, bool), PricingError> {
        let mut clamped = false;
        let mut clamp_f64 = |name: &str, original: f64, refund: f64| -> f64 {
            if refund > original {
                messages.push(format!(
                    "{name} refund {refund} exceeds original {original}; clamped"
                ));
                clamped = true;
                original
            } else {
                refund
            }
        };

        let result = match (original, refund) {
            (
                Usage::Transcription {
                    duration_seconds: original,
                },
                Usage::Transcription {
                    duration_seconds: refund,
                },
            ) => Usage::Transcription {
                duration_seconds: clamp_f64("duration", *original, *refund),
            },
            (
                Usage::TextToSpeech {
                    character_count: original,
                },
                Usage::TextToSpeech {
                    character_count: refund,
                },
            ) => Usage::TextToSpeech {
                character_count: clamp_f64("characters", *original as f64, *refund as f64) as u64,
            },
            (
                Usage::Media {
                    unit_count: original,
                },
                Usage::Media { unit_count: refund },
            ) => Usage::Media {
                unit_count: clamp_f64("units", *original as f64, *refund as f64) as u64,
            },
            (Usage::Realtime(original), Usage::Realtime(refund)) => {
                let input_audio_seconds = clamp_f64(
                    "input audio",
                    original.input_audio_seconds,
                    refund.input_audio_seconds,
                );
                let output_audio_seconds = clamp_f64(
                    "output audio",
                    original.output_audio_seconds,
                    refund.output_audio_seconds,
                );
                let input_tokens = match (original.input_tokens, refund.input_tokens) {
                    (Some(original), Some(refund)) => Some(clamp_f64(
                        "input tokens",
                        original as f64,
                        refund as f64,
                    ) as u64),
                    (_, refund) => refund,
                };
                let output_tokens = match (original.output_tokens, refund.output_tokens) {
                    (Some(original), Some(refund)) => Some(clamp_f64(
                        "output tokens",
                        original as f64,
                        refund as f64,
                    )
                        as u64),
                    (_, refund) => refund,
                };
                Usage::Realtime(crate::model::cost::RealtimeUsage {
                    input_audio_seconds,
                    output_audio_seconds,
                    input_tokens,
                    output_tokens,
                })
            }
            (original, refund) => {
                return Err(PricingError::Validation(format!(
                    "refund usage {refund:?} does not match the original usage {original:?}"
                )))
            }
        };
        Ok((result, clamped))
    }

    /// Aggregate audio/token refund lines the breakdown carries in addition
    /// to the per-component entries.
    fn refund_aggregates(components: &[CostComponent]) -> Vec<CostComponent> {
        let mut aggregates = Vec::new();
        for (name, matches) in [
            ("audio_refund", &["input_audio", "output_audio"][..]),
            ("token_refund", &["input_tokens", "output_tokens"][..]),
        ] {
            let parts: Vec<&CostComponent> = components
                .iter()
                .filter(|component| matches.contains(&component.name.as_str()))
                .collect();
            if parts.is_empty() {
                continue;
            }
            let unit_count = parts
                .iter()
                .fold(BigDecimal::zero(), |acc, part| acc + &part.unit_count);
            let cost = parts
                .iter()
                .fold(BigDecimal::zero(), |acc, part| acc + &part.cost);
            aggregates.push(CostComponent {
                name: name.to_string(),
                unit_count,
                rate_per_unit: BigDecimal::zero(),
                cost: round_money(cost),
            });
        }
        aggregates
    }
}

#[async_trait]
impl PricingService for PricingServiceDefault {
    async fn cost(
        &self,
        provider: &ProviderId,
        operation: ProviderOperation,
        model: &str,
        usage: &Usage,
    ) -> Result<CostResult, PricingError> {
        let resolved = self.resolve(provider, operation, model).await;
        let computed = Self::compute(&resolved.kind, usage, true)?;
        Ok(CostResult {
            provider: provider.clone(),
            operation,
            model: model.to_string(),
            unit_count: computed.unit_count,
            unit_type: computed.unit_type,
            rate_per_unit: computed.rate_per_unit,
            total_cost: computed.total,
            is_estimate: resolved.is_estimate,
            breakdown: Some(computed.components),
        })
    }

    async fn refund(&self, request: RefundRequest) -> Result<RefundResult, PricingError> {
        let reason = match request.reason.as_deref().map(str::trim) {
            Some(reason) if !reason.is_empty() => reason.to_string(),
            _ => {
                return Err(PricingError::Validation(
                    "a refund reason is required".to_string(),
                ))
            }
        };

        let mut messages = Vec::new();
        let (clamped_usage, clamped) =
            Self::clamp_refund(&request.original, &request.refund, &mut messages)?;

        let resolved = self
            .resolve(&request.provider, request.operation, &request.model)
            .await;
        let original = Self::compute(&resolved.kind, &request.original, true)?;
        let refund = Self::compute(&resolved.kind, &clamped_usage, false)?;

        let mut breakdown = Self::refund_aggregates(&refund.components);
        breakdown.extend(refund.components);

        let is_partial_refund = clamped || refund.total < original.total;
        Ok(RefundResult {
            provider: request.provider,
            operation: request.operation,
            model: request.model,
            reason,
            original_cost: original.total,
            refund_amount: refund.total,
            is_partial_refund,
            validation_messages: messages,
            breakdown: Some(breakdown),
        })
    }
}
