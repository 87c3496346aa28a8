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
use conduit_common::tracing::init_tracing_with_default_env_filter;
use conduit_common::SafeDisplay;
use conduit_generation_executor::bootstrap::Services;
use conduit_generation_executor::config::make_config_loader;
use conduit_generation_executor::services::media::InMemoryMediaStore;
use conduit_generation_executor::services::providers::{ProviderRegistry, StaticProviderRegistry};
use conduit_generation_executor::services::virtual_key::VirtualKeyServiceNoop;
use conduit_generation_executor::services::webhook::run_webhook_consumer;
use conduit_generation_executor::services::worker::{
    run_orphan_recovery, run_quality_maintenance, run_resilience_timers, run_stats_maintenance,
    run_task_cleanup, spawn_worker_pool,
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = match make_config_loader().load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {err}");
            std::process::exit(1);
        }
    };
    init_tracing_with_default_env_filter(&config.tracing);
    info!("Starting generation executor\n{}", config.to_safe_string());

    // The embedding gateway registers real provider adapters, the object
    // store and the virtual-key gate; the standalone binary runs with inert
    // defaults so the pipeline machinery can be operated and observed.
    let registry: Arc<dyn ProviderRegistry> = Arc::new(StaticProviderRegistry::new());
    warn!("no provider adapters registered; tasks will fail provider resolution");
    let media_store = Arc::new(InMemoryMediaStore::new("memory://conduit-media"));
    let virtual_keys = Arc::new(VirtualKeyServiceNoop::default());

    let services = Services::redis(&config, registry, media_store, virtual_keys).await?;
    info!(instance = %services.instance, "services initialized");

    let cancellation = CancellationToken::new();
    let mut join_set: JoinSet<Result<(), anyhow::Error>> = JoinSet::new();

    spawn_worker_pool(
        &mut join_set,
        services.orchestrator.clone(),
        services.queue.clone(),
        services.event_bus.clone(),
        &services.instance,
        config.workers.clone(),
        config.queue.claim_ttl,
        cancellation.clone(),
    );
    join_set.spawn(run_orphan_recovery(
        services.queue.clone(),
        config.queue.claim_ttl,
        cancellation.clone(),
    ));
    join_set.spawn(run_task_cleanup(
        services.task_service.clone(),
        config.cleanup_interval,
        chrono::Duration::from_std(config.task_retention)?,
        cancellation.clone(),
    ));
    join_set.spawn(run_stats_maintenance(
        services.stats.clone(),
        config
            .monitored_regions
            .iter()
            .map(|region| Region::new(region.clone()))
            .collect(),
        config.cache_stats.heartbeat_ttl / 3,
        cancellation.clone(),
    ));
    join_set.spawn(run_quality_maintenance(
        services.quality.clone(),
        config.cleanup_interval,
        cancellation.clone(),
    ));
    join_set.spawn(run_resilience_timers(
        services.resilience.clone(),
        config.resilience.clone(),
        cancellation.clone(),
    ));
    join_set.spawn({
        let progress = services.progress.clone();
        let token = cancellation.clone();
        async move { progress.run(token).await }
    });
    join_set.spawn(run_webhook_consumer(
        services.event_bus.clone(),
        services.task_service.clone(),
        services.webhook_service.clone(),
        cancellation.clone(),
    ));

    info!("generation executor running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining workers");
    cancellation.cancel();

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("background task failed: {err}"),
            Err(err) => warn!("background task panicked: {err}"),
        }
    }
    info!("generation executor stopped");
    Ok(())
}
