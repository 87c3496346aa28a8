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

use conduit_common::model::Region;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cache metrics tracked per region and instance, mirrored into a per-region
/// global counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheMetric {
    HitCount,
    MissCount,
    SetCount,
    RemoveCount,
    EvictionCount,
    ErrorCount,
    EntryCount,
    TotalDataBytes,
}

impl CacheMetric {
    pub const ALL: [CacheMetric; 8] = [
        CacheMetric::HitCount,
        CacheMetric::MissCount,
        CacheMetric::SetCount,
        CacheMetric::RemoveCount,
        CacheMetric::EvictionCount,
        CacheMetric::ErrorCount,
        CacheMetric::EntryCount,
        CacheMetric::TotalDataBytes,
    ];

    pub fn field_name(&self) -> &'static str {
        match self {
            CacheMetric::HitCount => "HitCount",
            CacheMetric::MissCount => "MissCount",
            CacheMetric::SetCount => "SetCount",
            CacheMetric::RemoveCount => "RemoveCount",
            CacheMetric::EvictionCount => "EvictionCount",
            CacheMetric::ErrorCount => "ErrorCount",
            CacheMetric::EntryCount => "EntryCount",
            CacheMetric::TotalDataBytes => "TotalDataBytes",
        }
    }

    pub fn from_field_name(name: &str) -> Option<CacheMetric> {
        CacheMetric::ALL
            .iter()
            .find(|metric| metric.field_name() == name)
            .copied()
    }
}

/// Cache operations for which response-time samples are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheOperation {
    Get,
    Set,
}

impl CacheOperation {
    pub const ALL: [CacheOperation; 2] = [CacheOperation::Get, CacheOperation::Set];

    pub fn key_segment(&self) -> &'static str {
        match self {
            CacheOperation::Get => "get",
            CacheOperation::Set => "set",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponseTimePercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Minimum acceptable hit rate, 0.0..=1.0.
    pub min_hit_rate: f64,
    pub max_response_time_ms: f64,
    /// Maximum acceptable error rate, 0.0..=1.0.
    pub max_error_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheAlertType {
    LowHitRate,
    SlowResponse,
    HighErrorRate,
}

impl CacheAlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheAlertType::LowHitRate => "LowHitRate",
            CacheAlertType::SlowResponse => "SlowResponse",
            CacheAlertType::HighErrorRate => "HighErrorRate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheAlert {
    pub region: Region,
    pub alert_type: CacheAlertType,
    pub message: String,
}

/// Point-in-time JSON dump of one region's statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSnapshot {
    pub region: Region,
    pub counters: HashMap<String, u64>,
    pub hit_rate: f64,
    pub error_rate: f64,
    pub get_percentiles: ResponseTimePercentiles,
    pub set_percentiles: ResponseTimePercentiles,
    pub live_instances: usize,
}
