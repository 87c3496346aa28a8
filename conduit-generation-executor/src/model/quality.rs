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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One transcription quality observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    pub confidence: f64,
    pub accuracy: f64,
    pub word_error_rate: f64,
    pub timestamp: DateTime<Utc>,
}

/// Axis a rolling quality window is kept on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityAxis {
    Provider,
    Model,
    Language,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Improving,
    Declining,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub sample_count: usize,
    pub average_confidence: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
    pub std_dev_confidence: f64,
    /// Fraction of samples with confidence below 0.7.
    pub low_confidence_rate: f64,
    /// Fraction of samples with confidence at or above 0.95.
    pub high_confidence_rate: f64,
    pub average_word_error_rate: f64,
    pub trend: TrendDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRecommendation {
    pub axis: QualityAxis,
    pub key: String,
    pub message: String,
}
