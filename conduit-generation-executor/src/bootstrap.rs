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

use crate::config::GenerationExecutorConfig;
use crate::services::events::{EventBus, PubSubEventBus};
use crate::services::media::MediaStore;
use crate::services::orchestrator::Orchestrator;
use crate::services::pricing::{PricingService, PricingServiceDefault};
use crate::services::progress::ProgressTracker;
use crate::services::providers::{
    ProviderRegistry, ProviderRouter, WeightedProviderRouter,
};
use crate::services::quality::QualityTracker;
use crate::services::queue::{WorkQueueService, WorkQueueServiceDefault};
use crate::services::rates::InMemoryRateOverrideService;
use crate::services::resilience::{ResilienceService, ResilienceServiceDefault};
use crate::services::stats::{CacheStatsService, CacheStatsServiceDefault};
use crate::services::task::{TaskService, TaskServiceDefault};
use crate::services::virtual_key::VirtualKeyService;
use crate::services::webhook::{WebhookService, WebhookServiceDefault};
use crate::storage::keyvalue::memory::InMemoryKeyValueStorage;
use crate::storage::keyvalue::redis::RedisKeyValueStorage;
use crate::storage::keyvalue::KeyValueStorage;
use crate::storage::pubsub::memory::InMemoryPubSub;
use crate::storage::pubsub::redis::RedisPubSub;
use crate::storage::pubsub::PubSubStorage;
use crate::storage::stream::memory::InMemoryStreamStorage;
use crate::storage::stream::redis::RedisStreamStorage;
use crate::storage::stream::StreamStorage;
use anyhow::anyhow;
use conduit_common::model::{InstanceId, WorkerId};
use conduit_common::redis::RedisPool;
use std::sync::Arc;

/// Everything the executor runs on, wired once at startup. Provider
/// adapters, the media store and the virtual-key gate are external
/// collaborators and are passed in by the embedding gateway.
#[derive(Clone)]
pub struct Services {
    pub instance: WorkerId,
    pub task_service: Arc<dyn TaskService>,
    pub queue: Arc<dyn WorkQueueService>,
    pub event_bus: Arc<dyn EventBus>,
    pub pricing: Arc<dyn PricingService>,
    pub rate_overrides: Arc<InMemoryRateOverrideService>,
    pub stats: Arc<dyn CacheStatsService>,
    pub quality: Arc<QualityTracker>,
    pub resilience: Arc<dyn ResilienceService>,
    pub router: Arc<dyn ProviderRouter>,
    pub registry: Arc<dyn ProviderRegistry>,
    pub media_store: Arc<dyn MediaStore>,
    pub virtual_keys: Arc<dyn VirtualKeyService>,
    pub webhook_service: Arc<dyn WebhookService>,
    pub progress: Arc<ProgressTracker>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Services {
    /// Production wiring on Redis-backed storage.
    pub async fn redis(
        config: &GenerationExecutorConfig,
        registry: Arc<dyn ProviderRegistry>,
        media_store: Arc<dyn MediaStore>,
        virtual_keys: Arc<dyn VirtualKeyService>,
    ) -> Result<Self, anyhow::Error> {
        let pool = RedisPool::configured(&config.redis)
            .await
            .map_err(|err| anyhow!(err).context("Redis connection"))?;
        let key_value_storage: Arc<dyn KeyValueStorage> =
            Arc::new(RedisKeyValueStorage::new(pool.clone()));
        let stream_storage: Arc<dyn StreamStorage> =
            Arc::new(RedisStreamStorage::new(pool.clone()));
        let pubsub: Arc<dyn PubSubStorage> = Arc::new(RedisPubSub::new(pool));
        Self::make(
            config,
            key_value_storage,
            stream_storage,
            pubsub,
            registry,
            media_store,
            virtual_keys,
        )
    }

    /// Fully in-process wiring; used by tests and local development.
    pub fn in_memory(
        config: &GenerationExecutorConfig,
        registry: Arc<dyn ProviderRegistry>,
        media_store: Arc<dyn MediaStore>,
        virtual_keys: Arc<dyn VirtualKeyService>,
    ) -> Result<Self, anyhow::Error> {
        Self::make(
            config,
            Arc::new(InMemoryKeyValueStorage::new()),
            Arc::new(InMemoryStreamStorage::new()),
            Arc::new(InMemoryPubSub::new()),
            registry,
            media_store,
            virtual_keys,
        )
    }

    fn make(
        config: &GenerationExecutorConfig,
        key_value_storage: Arc<dyn KeyValueStorage>,
        stream_storage: Arc<dyn StreamStorage>,
        pubsub: Arc<dyn PubSubStorage>,
        registry: Arc<dyn ProviderRegistry>,
        media_store: Arc<dyn MediaStore>,
        virtual_keys: Arc<dyn VirtualKeyService>,
    ) -> Result<Self, anyhow::Error> {
        let instance = match &config.instance_id {
            Some(id) => WorkerId::new(id.clone()),
            None => WorkerId::generate("executor"),
        };

        let task_service: Arc<dyn TaskService> =
            Arc::new(TaskServiceDefault::new(key_value_storage.clone()));

        let queue: Arc<dyn WorkQueueService> = Arc::new(WorkQueueServiceDefault::new(
            key_value_storage.clone(),
            stream_storage.clone(),
            config.queue.clone(),
        ));

        let event_bus: Arc<dyn EventBus> = Arc::new(PubSubEventBus::new(pubsub.clone()));

        let rate_overrides = Arc::new(InMemoryRateOverrideService::new());
        let pricing: Arc<dyn PricingService> =
            Arc::new(PricingServiceDefault::new(rate_overrides.clone()));

        let stats: Arc<dyn CacheStatsService> = Arc::new(CacheStatsServiceDefault::new(
            key_value_storage.clone(),
            pubsub.clone(),
            InstanceId::new(instance.as_str()),
            config.cache_stats.clone(),
        ));

        let quality = Arc::new(QualityTracker::new(config.quality.clone()));

        let router: Arc<dyn ProviderRouter> =
            Arc::new(WeightedProviderRouter::new(registry.clone()));

        let resilience: Arc<dyn ResilienceService> = Arc::new(ResilienceServiceDefault::new(
            registry.clone(),
            router.clone(),
            event_bus.clone(),
            key_value_storage.clone(),
            config.resilience.clone(),
        ));

        let webhook_service: Arc<dyn WebhookService> = Arc::new(
            WebhookServiceDefault::new(config.webhooks.clone())
                .map_err(|err| anyhow!(err).context("webhook client"))?,
        );

        let progress = Arc::new(ProgressTracker::new(
            task_service.clone(),
            event_bus.clone(),
            config.progress.clone(),
        ));

        let orchestrator = Arc::new(
            Orchestrator::new(
                task_service.clone(),
                queue.clone(),
                event_bus.clone(),
                pricing.clone(),
                resilience.clone(),
                router.clone(),
                registry.clone(),
                media_store.clone(),
                virtual_keys.clone(),
                quality.clone(),
                progress.clone(),
                config.orchestrator.clone(),
            )
            .map_err(|err| anyhow!(err).context("orchestrator"))?,
        );

        Ok(Self {
            instance,
            task_service,
            queue,
            event_bus,
            pricing,
            rate_overrides,
            stats,
            quality,
            resilience,
            router,
            registry,
            media_store,
            virtual_keys,
            webhook_service,
            progress,
            orchestrator,
        })
    }
}
