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

//! Distributed cache statistics (C5): per-instance and per-region-global
//! counters via atomic increments, response-time percentiles over the union
//! of live instances, heartbeat-based liveness and threshold-driven alerts
//! with a per-(region, alert) cooldown.

use crate::model::event::{EventEnvelope, LifecycleEvent};
use crate::model::stats::{
    AlertThresholds, CacheAlert, CacheAlertType, CacheMetric, CacheOperation, RegionSnapshot,
    ResponseTimePercentiles,
};
use crate::storage::keyvalue::{KeyValueStorage, KeyValueStorageNamespace};
use crate::storage::pubsub::PubSubStorage;
use crate::storage::{deserialize_entity, serialize_entity, StorageError};
use async_trait::async_trait;
use chrono::Utc;
use conduit_common::model::{InstanceId, Region};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

const SVC_NAME: &str = "cache-stats";
const NS: KeyValueStorageNamespace = KeyValueStorageNamespace::CacheStats;

const INSTANCES_KEY: &str = "instances";
pub const STATS_UPDATES_CHANNEL: &str = "conduit:cache:stats:updates";
pub const ALERTS_CHANNEL: &str = "conduit:cache:alerts";

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheStatsConfig {
    /// TTL on this instance's heartbeat key; an instance is live while its
    /// heartbeat is unexpired.
    #[serde(with = "humantime_serde")]
    pub heartbeat_ttl: Duration,
    /// Minimum spacing between two alerts of the same type for one region.
    #[serde(with = "humantime_serde")]
    pub alert_cooldown: Duration,
    /// Newest response-time samples kept per (region, op, instance).
    pub max_samples: usize,
}

impl Default for CacheStatsConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl: Duration::from_secs(30),
            alert_cooldown: Duration::from_secs(5 * 60),
            max_samples: 1000,
        }
    }
}

fn instance_counters_key(region: &Region, instance: &InstanceId) -> String {
    format!("stats:{}:{}", region, instance)
}

fn global_counters_key(region: &Region) -> String {
    format!("stats:{}:global", region)
}

fn response_key(region: &Region, op: CacheOperation, instance: &InstanceId) -> String {
    format!("response:{}:{}:{}", region, op.key_segment(), instance)
}

fn heartbeat_key(instance: &InstanceId) -> String {
    format!("heartbeat:{instance}")
}

fn thresholds_key(region: &Region) -> String {
    format!("alerts:{region}")
}

#[async_trait]
pub trait CacheStatsService: Send + Sync {
    /// Two atomic increments: `(region, instance, metric)` and
    /// `(region, global, metric)`.
    async fn record(&self, region: &Region, metric: CacheMetric, delta: i64)
        -> Result<(), StatsError>;

    async fn record_response_time(
        &self,
        region: &Region,
        op: CacheOperation,
        duration: Duration,
    ) -> Result<(), StatsError>;

    /// Counters for one instance, or the region-global mirror when `instance`
    /// is `None`.
    async fn counters(
        &self,
        region: &Region,
        instance: Option<&InstanceId>,
    ) -> Result<HashMap<CacheMetric, u64>, StatsError>;

    /// Percentiles over the union of live instances' samples; zeros on an
    /// empty sample set.
    async fn percentiles(
        &self,
        region: &Region,
        op: CacheOperation,
    ) -> Result<ResponseTimePercentiles, StatsError>;

    async fn live_instances(&self) -> Result<Vec<InstanceId>, StatsError>;

    async fn heartbeat(&self) -> Result<(), StatsError>;

    /// Removes this instance from the registry; called on shutdown.
    async fn unregister(&self) -> Result<(), StatsError>;

    async fn set_thresholds(
        &self,
        region: &Region,
        thresholds: AlertThresholds,
    ) -> Result<(), StatsError>;

    /// Evaluates thresholds and publishes at most one alert per
    /// (region, alert type) per cooldown window.
    async fn check_alerts(&self, region: &Region) -> Result<Vec<CacheAlert>, StatsError>;

    async fn snapshot(&self, region: &Region) -> Result<RegionSnapshot, StatsError>;

    /// Prometheus text exposition for the given regions.
    async fn prometheus_exposition(&self, regions: &[Region]) -> Result<String, StatsError>;
}

pub struct CacheStatsServiceDefault {
    key_value_storage: Arc<dyn KeyValueStorage>,
    pubsub: Arc<dyn PubSubStorage>,
    instance: InstanceId,
    config: CacheStatsConfig,
    alert_cooldowns: Mutex<HashMap<(Region, CacheAlertType), Instant>>,
}

impl CacheStatsServiceDefault {
    pub fn new(
        key_value_storage: Arc<dyn KeyValueStorage>,
        pubsub: Arc<dyn PubSubStorage>,
        instance: InstanceId,
        config: CacheStatsConfig,
    ) -> Self {
        Self {
            key_value_storage,
            pubsub,
            instance,
            config,
            alert_cooldowns: Mutex::new(HashMap::new()),
        }
    }

    async fn counter(&self, region: &Region, metric: CacheMetric) -> Result<u64, StatsError> {
        let counters = self.counters(region, None).await?;
        Ok(counters.get(&metric).copied().unwrap_or(0))
    }

    /// Alert-cooldown bookkeeping is process-local; across instances the
    /// dedup is best-effort and an alert may fire twice within a window.
    fn cooldown_elapsed(&self, region: &Region, alert_type: CacheAlertType) -> bool {
        let mut cooldowns = self.alert_cooldowns.lock().unwrap();
        let key = (region.clone(), alert_type);
        match cooldowns.get(&key) {
            Some(last) if last.elapsed() < self.config.alert_cooldown => false,
            _ => {
                cooldowns.insert(key, Instant::now());
                true
            }
        }
    }

    async fn rates(&self, region: &Region) -> Result<(f64, f64), StatsError> {
        let counters = self.counters(region, None).await?;
        let get = |metric: CacheMetric| counters.get(&metric).copied().unwrap_or(0) as f64;
        let hits = get(CacheMetric::HitCount);
        let misses = get(CacheMetric::MissCount);
        let operations =
            hits + misses + get(CacheMetric::SetCount) + get(CacheMetric::RemoveCount);
        let hit_rate = if hits + misses > 0.0 {
            hits / (hits + misses)
        } else {
            0.0
        };
        let error_rate = if operations > 0.0 {
            get(CacheMetric::ErrorCount) / operations
        } else {
            0.0
        };
        Ok((hit_rate, error_rate))
    }

    async fn thresholds(&self, region: &Region) -> Result<Option<AlertThresholds>, StatsError> {
        match self
            .key_value_storage
            .get(SVC_NAME, "thresholds", "thresholds", NS, &thresholds_key(region))
            .await?
        {
            Some(bytes) => Ok(Some(deserialize_entity(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn publish_alert(&self, alert: &CacheAlert) -> Result<(), StatsError> {
        let envelope = EventEnvelope::new(LifecycleEvent::CacheAlert {
            region: alert.region.clone(),
            alert_type: alert.alert_type.as_str().to_string(),
            message: alert.message.clone(),
        });
        let payload = serialize_entity(SVC_NAME, "alert", &envelope)?;
        self.pubsub
            .publish(SVC_NAME, "alert", ALERTS_CHANNEL, &payload)
            .await?;
        Ok(())
    }
}

fn nearest_rank(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[async_trait]
impl CacheStatsService for CacheStatsServiceDefault {
    async fn record(
        &self,
        region: &Region,
        metric: CacheMetric,
        delta: i64,
    ) -> Result<(), StatsError> {
        self.key_value_storage
            .increment_field(
                SVC_NAME,
                "record",
                NS,
                &instance_counters_key(region, &self.instance),
                metric.field_name(),
                delta,
            )
            .await?;
        self.key_value_storage
            .increment_field(
                SVC_NAME,
                "record",
                NS,
                &global_counters_key(region),
                metric.field_name(),
                delta,
            )
            .await?;

        let update = EventEnvelope::new(LifecycleEvent::CacheStatisticsUpdate {
            region: region.clone(),
            metric: metric.field_name().to_string(),
            delta,
        });
        let payload = serialize_entity(SVC_NAME, "stats-update", &update)?;
        self.pubsub
            .publish(SVC_NAME, "record", STATS_UPDATES_CHANNEL, &payload)
            .await?;
        Ok(())
    }

    async fn record_response_time(
        &self,
        region: &Region,
        op: CacheOperation,
        duration: Duration,
    ) -> Result<(), StatsError> {
        let key = response_key(region, op, &self.instance);
        let member = format!("{}:{}", duration.as_millis(), Uuid::new_v4());
        self.key_value_storage
            .add_to_sorted_set(
                SVC_NAME,
                "record-response",
                NS,
                &key,
                Utc::now().timestamp_millis() as f64,
                &member,
            )
            .await?;
        self.key_value_storage
            .trim_sorted_set(SVC_NAME, "record-response", NS, &key, self.config.max_samples)
            .await?;
        Ok(())
    }

    async fn counters(
        &self,
        region: &Region,
        instance: Option<&InstanceId>,
    ) -> Result<HashMap<CacheMetric, u64>, StatsError> {
        let key = match instance {
            Some(instance) => instance_counters_key(region, instance),
            None => global_counters_key(region),
        };
        let fields = self
            .key_value_storage
            .get_fields(SVC_NAME, "counters", NS, &key)
            .await?;
        let mut counters = HashMap::new();
        for (field, value) in fields {
            if let (Some(metric), Ok(count)) =
                (CacheMetric::from_field_name(&field), value.parse::<i64>())
            {
                counters.insert(metric, count.max(0) as u64);
            }
        }
        Ok(counters)
    }

    async fn percentiles(
        &self,
        region: &Region,
        op: CacheOperation,
    ) -> Result<ResponseTimePercentiles, StatsError> {
        let mut samples: Vec<f64> = Vec::new();
        for instance in self.live_instances().await? {
            let entries = self
                .key_value_storage
                .sorted_set_entries(SVC_NAME, "percentiles", NS, &response_key(region, op, &instance))
                .await?;
            for (member, _) in entries {
                match member.split(':').next().and_then(|ms| ms.parse::<f64>().ok()) {
                    Some(millis) => samples.push(millis),
                    None => warn!(member = %member, "dropping malformed response-time sample"),
                }
            }
        }
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Ok(ResponseTimePercentiles {
            p50: nearest_rank(&samples, 0.50),
            p95: nearest_rank(&samples, 0.95),
            p99: nearest_rank(&samples, 0.99),
            sample_count: samples.len(),
        })
    }

    async fn live_instances(&self) -> Result<Vec<InstanceId>, StatsError> {
        let members = self
            .key_value_storage
            .members_of_set(SVC_NAME, "live-instances", NS, INSTANCES_KEY)
            .await?;
        let mut live = Vec::new();
        for member in members {
            let instance = InstanceId::new(member);
            if self
                .key_value_storage
                .exists(SVC_NAME, "live-instances", NS, &heartbeat_key(&instance))
                .await?
            {
                live.push(instance);
            }
        }
        live.sort();
        Ok(live)
    }

    async fn heartbeat(&self) -> Result<(), StatsError> {
        self.key_value_storage
            .add_to_set(SVC_NAME, "heartbeat", NS, INSTANCES_KEY, self.instance.as_str())
            .await?;
        self.key_value_storage
            .set(
                SVC_NAME,
                "heartbeat",
                "heartbeat",
                NS,
                &heartbeat_key(&self.instance),
                Utc::now().to_rfc3339().as_bytes(),
                Some(self.config.heartbeat_ttl),
            )
            .await?;
        Ok(())
    }

    async fn unregister(&self) -> Result<(), StatsError> {
        self.key_value_storage
            .del(SVC_NAME, "unregister", NS, &heartbeat_key(&self.instance))
            .await?;
        self.key_value_storage
            .remove_from_set(
                SVC_NAME,
                "unregister",
                NS,
                INSTANCES_KEY,
                self.instance.as_str(),
            )
            .await?;
        Ok(())
    }

    async fn set_thresholds(
        &self,
        region: &Region,
        thresholds: AlertThresholds,
    ) -> Result<(), StatsError> {
        let bytes = serialize_entity(SVC_NAME, "thresholds", &thresholds)?;
        self.key_value_storage
            .set(
                SVC_NAME,
                "set-thresholds",
                "thresholds",
                NS,
                &thresholds_key(region),
                &bytes,
                None,
            )
            .await?;
        Ok(())
    }

    async fn check_alerts(&self, region: &Region) -> Result<Vec<CacheAlert>, StatsError> {
        let thresholds = match self.thresholds(region).await? {
            Some(thresholds) => thresholds,
            None => return Ok(Vec::new()),
        };
        let (hit_rate, error_rate) = self.rates(region).await?;
        let get_percentiles = self.percentiles(region, CacheOperation::Get).await?;

        let mut alerts = Vec::new();
        let hits_and_misses = {
            let counters = self.counters(region, None).await?;
            counters.get(&CacheMetric::HitCount).copied().unwrap_or(0)
                + counters.get(&CacheMetric::MissCount).copied().unwrap_or(0)
        };
        if hits_and_misses > 0
            && hit_rate < thresholds.min_hit_rate
            && self.cooldown_elapsed(region, CacheAlertType::LowHitRate)
        {
            alerts.push(CacheAlert {
                region: region.clone(),
                alert_type: CacheAlertType::LowHitRate,
                message: format!(
                    "hit rate {hit_rate:.3} is below the minimum {:.3}",
                    thresholds.min_hit_rate
                ),
            });
        }
        if get_percentiles.sample_count > 0
            && get_percentiles.p95 > thresholds.max_response_time_ms
            && self.cooldown_elapsed(region, CacheAlertType::SlowResponse)
        {
            alerts.push(CacheAlert {
                region: region.clone(),
                alert_type: CacheAlertType::SlowResponse,
                message: format!(
                    "p95 response time {:.1}ms exceeds the maximum {:.1}ms",
                    get_percentiles.p95, thresholds.max_response_time_ms
                ),
            });
        }
        if error_rate > thresholds.max_error_rate
            && self.cooldown_elapsed(region, CacheAlertType::HighErrorRate)
        {
            alerts.push(CacheAlert {
                region: region.clone(),
                alert_type: CacheAlertType::HighErrorRate,
                message: format!(
                    "error rate {error_rate:.3} exceeds the maximum {:.3}",
                    thresholds.max_error_rate
                ),
            });
        }

        for alert in &alerts {
            self.publish_alert(alert).await?;
        }
        Ok(alerts)
    }

    async fn snapshot(&self, region: &Region) -> Result<RegionSnapshot, StatsError> {
        let counters = self.counters(region, None).await?;
        let (hit_rate, error_rate) = self.rates(region).await?;
        Ok(RegionSnapshot {
            region: region.clone(),
            counters: counters
                .iter()
                .map(|(metric, count)| (metric.field_name().to_string(), *count))
                .collect(),
            hit_rate,
            error_rate,
            get_percentiles: self.percentiles(region, CacheOperation::Get).await?,
            set_percentiles: self.percentiles(region, CacheOperation::Set).await?,
            live_instances: self.live_instances().await?.len(),
        })
    }

    async fn prometheus_exposition(&self, regions: &[Region]) -> Result<String, StatsError> {
        use std::fmt::Write;

        let mut output = String::new();
        let _ = writeln!(&mut output, "# TYPE cache_hits_total counter");
        for region in regions {
            let hits = self.counter(region, CacheMetric::HitCount).await?;
            let _ = writeln!(&mut output, "cache_hits_total{{region=\"{region}\"}} {hits}");
        }
        let _ = writeln!(&mut output, "# TYPE cache_misses_total counter");
        for region in regions {
            let misses = self.counter(region, CacheMetric::MissCount).await?;
            let _ = writeln!(
                &mut output,
                "cache_misses_total{{region=\"{region}\"}} {misses}"
            );
        }
        let _ = writeln!(&mut output, "# TYPE cache_hit_rate gauge");
        for region in regions {
            let (hit_rate, _) = self.rates(region).await?;
            let _ = writeln!(
                &mut output,
                "cache_hit_rate{{region=\"{region}\"}} {hit_rate}"
            );
        }
        let _ = writeln!(
            &mut output,
            "# TYPE cache_response_time_milliseconds summary"
        );
        for region in regions {
            let percentiles = self.percentiles(region, CacheOperation::Get).await?;
            for (quantile, value) in [
                ("0.5", percentiles.p50),
                ("0.95", percentiles.p95),
                ("0.99", percentiles.p99),
            ] {
                let _ = writeln!(
                    &mut output,
                    "cache_response_time_milliseconds{{region=\"{region}\",quantile=\"{quantile}\"}} {value}"
                );
            }
        }
        Ok(output)
    }
}
