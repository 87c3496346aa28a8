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

use crate::model::quality::{
    QualityAxis, QualityMetrics, QualityRecommendation, QualitySample, TrendDirection,
};
use chrono::Utc;
use conduit_common::model::ProviderId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityTrackerConfig {
    /// Samples older than this are dropped by the sweeper.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// Number of samples on each end used for trend detection.
    pub trend_window: usize,
    /// Relative confidence change that counts as a trend.
    pub trend_threshold: f64,
    pub low_confidence_threshold: f64,
    pub high_confidence_threshold: f64,
    /// Providers averaging below this confidence get a recommendation.
    pub provider_confidence_floor: f64,
    /// Languages averaging above this WER get a recommendation.
    pub language_wer_ceiling: f64,
}

impl Default for QualityTrackerConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            trend_window: 5,
            trend_threshold: 0.05,
            low_confidence_threshold: 0.7,
            high_confidence_threshold: 0.95,
            provider_confidence_floor: 0.8,
            language_wer_ceiling: 0.15,
        }
    }
}

/// Rolling quality windows per provider, model and language (C6). Purely
/// CPU-bound and process-local; the windows rebuild from live traffic after a
/// restart.
pub struct QualityTracker {
    config: QualityTrackerConfig,
    windows: Mutex<HashMap<(QualityAxis, String), VecDeque<QualitySample>>>,
}

impl QualityTracker {
    pub fn new(config: QualityTrackerConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(
        &self,
        provider: &ProviderId,
        model: &str,
        language: &str,
        sample: QualitySample,
    ) {
        let mut windows = self.windows.lock().unwrap();
        for key in [
            (QualityAxis::Provider, provider.to_string()),
            (QualityAxis::Model, model.to_string()),
            (QualityAxis::Language, language.to_string()),
        ] {
            windows.entry(key).or_default().push_back(sample);
        }
    }

    pub fn metrics(&self, axis: QualityAxis, key: &str) -> Option<QualityMetrics> {
        let windows = self.windows.lock().unwrap();
        let samples = windows.get(&(axis, key.to_string()))?;
        if samples.is_empty() {
            return None;
        }

        let confidences: Vec<f64> = samples.iter().map(|sample| sample.confidence).collect();
        let count = confidences.len();
        let sum: f64 = confidences.iter().sum();
        let average = sum / count as f64;
        let variance = confidences
            .iter()
            .map(|confidence| (confidence - average).powi(2))
            .sum::<f64>()
            / count as f64;
        let low = confidences
            .iter()
            .filter(|confidence| **confidence < self.config.low_confidence_threshold)
            .count();
        let high = confidences
            .iter()
            .filter(|confidence| **confidence >= self.config.high_confidence_threshold)
            .count();
        let average_wer = samples
            .iter()
            .map(|sample| sample.word_error_rate)
            .sum::<f64>()
            / count as f64;

        Some(QualityMetrics {
            sample_count: count,
            average_confidence: average,
            min_confidence: confidences.iter().cloned().fold(f64::INFINITY, f64::min),
            max_confidence: confidences.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            std_dev_confidence: variance.sqrt(),
            low_confidence_rate: low as f64 / count as f64,
            high_confidence_rate: high as f64 / count as f64,
            average_word_error_rate: average_wer,
            trend: self.trend(&confidences),
        })
    }

    /// Mean of the newest `trend_window` confidences against the oldest;
    /// a relative change beyond the threshold marks a trend.
    fn trend(&self, confidences: &[f64]) -> TrendDirection {
        let window = self.config.trend_window;
        if confidences.len() < window * 2 {
            return TrendDirection::Stable;
        }
        let oldest: f64 = confidences[..window].iter().sum::<f64>() / window as f64;
        let newest: f64 =
            confidences[confidences.len() - window..].iter().sum::<f64>() / window as f64;
        if oldest == 0.0 {
            return TrendDirection::Stable;
        }
        let change = (newest - oldest) / oldest;
        if change > self.config.trend_threshold {
            TrendDirection::Improving
        } else if change < -self.config.trend_threshold {
            TrendDirection::Declining
        } else {
            TrendDirection::Stable
        }
    }

    pub fn recommendations(&self) -> Vec<QualityRecommendation> {
        let keys: Vec<(QualityAxis, String)> = {
            let windows = self.windows.lock().unwrap();
            windows.keys().cloned().collect()
        };

        let mut recommendations = Vec::new();
        for (axis, key) in keys {
            let metrics = match self.metrics(axis, &key) {
                Some(metrics) => metrics,
                None => continue,
            };
            match axis {
                QualityAxis::Provider
                    if metrics.average_confidence < self.config.provider_confidence_floor =>
                {
                    recommendations.push(QualityRecommendation {
                        axis,
                        key: key.clone(),
                        message: format!(
                            "provider {key} averages {:.2} confidence; consider rerouting its traffic",
                            metrics.average_confidence
                        ),
                    });
                }
                QualityAxis::Language
                    if metrics.average_word_error_rate > self.config.language_wer_ceiling =>
                {
                    recommendations.push(QualityRecommendation {
                        axis,
                        key: key.clone(),
                        message: format!(
                            "language {key} averages {:.2} WER; consider a specialized model",
                            metrics.average_word_error_rate
                        ),
                    });
                }
                _ => {}
            }
        }
        recommendations.sort_by(|a, b| a.key.cmp(&b.key));
        recommendations
    }

    /// Drops samples beyond the retention window; returns how many were
    /// removed.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut windows = self.windows.lock().unwrap();
        let mut removed = 0;
        for samples in windows.values_mut() {
            while let Some(sample) = samples.front() {
                if sample.timestamp < cutoff {
                    samples.pop_front();
                    removed += 1;
                } else {
                    break;
                }
            }
        }
        windows.retain(|_, samples| !samples.is_empty());
        removed
    }
}
