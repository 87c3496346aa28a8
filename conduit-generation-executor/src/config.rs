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

use crate::services::orchestrator::OrchestratorConfig;
use crate::services::progress::ProgressTrackerConfig;
use crate::services::quality::QualityTrackerConfig;
use crate::services::queue::WorkQueueConfig;
use crate::services::resilience::ResilienceConfig;
use crate::services::stats::CacheStatsConfig;
use crate::services::webhook::WebhookDeliveryConfig;
use crate::services::worker::WorkerConfig;
use conduit_common::config::{ConfigLoader, RedisConfig};
use conduit_common::tracing::TracingConfig;
use conduit_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationExecutorConfig {
    pub tracing: TracingConfig,
    pub redis: RedisConfig,
    /// Stable identity of this instance; generated at startup when absent.
    pub instance_id: Option<String>,
    pub workers: WorkerConfig,
    pub queue: WorkQueueConfig,
    pub orchestrator: OrchestratorConfig,
    pub webhooks: WebhookDeliveryConfig,
    pub resilience: ResilienceConfig,
    pub cache_stats: CacheStatsConfig,
    /// Cache regions whose alert thresholds are evaluated by this instance.
    pub monitored_regions: Vec<String>,
    pub progress: ProgressTrackerConfig,
    pub quality: QualityTrackerConfig,
    /// How often terminal task records are swept.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Terminal records older than this are deleted by the sweep.
    #[serde(with = "humantime_serde")]
    pub task_retention: Duration,
}

impl Default for GenerationExecutorConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("generation-executor"),
            redis: RedisConfig::default(),
            instance_id: None,
            workers: WorkerConfig::default(),
            queue: WorkQueueConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            webhooks: WebhookDeliveryConfig::default(),
            resilience: ResilienceConfig::default(),
            cache_stats: CacheStatsConfig::default(),
            monitored_regions: vec!["VirtualKeys".to_string(), "ModelMappings".to_string()],
            progress: ProgressTrackerConfig::default(),
            quality: QualityTrackerConfig::default(),
            cleanup_interval: Duration::from_secs(15 * 60),
            task_retention: Duration::from_secs(2 * 60 * 60),
        }
    }
}

impl SafeDisplay for GenerationExecutorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "redis:");
        let _ = writeln!(&mut result, "{}", self.redis.to_safe_string_indented());
        let _ = writeln!(
            &mut result,
            "instance id: {}",
            self.instance_id.as_deref().unwrap_or("<generated>")
        );
        let _ = writeln!(&mut result, "workers: {}", self.workers.worker_count);
        let _ = writeln!(&mut result, "claim TTL: {:?}", self.queue.claim_ttl);
        let _ = writeln!(
            &mut result,
            "webhook signing: {}",
            if self.webhooks.signing_secret.is_some() {
                "****"
            } else {
                "disabled"
            }
        );
        let _ = writeln!(
            &mut result,
            "monitored regions: {}",
            self.monitored_regions.join(", ")
        );
        let _ = writeln!(&mut result, "task retention: {:?}", self.task_retention);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<GenerationExecutorConfig> {
    ConfigLoader::new(&PathBuf::from("config/generation-executor.toml"))
}
