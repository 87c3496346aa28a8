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

//! The worker pool: a fixed set of cooperative dequeue-execute loops per
//! instance, plus the periodic maintenance loops (orphan recovery, task
//! cleanup, statistics heartbeat and alerting, resilience timers).

use crate::model::event::{EventEnvelope, LifecycleEvent};
use crate::services::events::EventBus;
use crate::services::orchestrator::Orchestrator;
use crate::services::queue::{QueueError, WorkQueueService};
use crate::services::resilience::{ResilienceConfig, ResilienceService};
use crate::services::stats::CacheStatsService;
use crate::services::task::TaskService;
use conduit_common::model::{Region, WorkerId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    pub worker_count: usize,
    /// Idle sleep between dequeue attempts when the queue is empty.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Claim heartbeat cadence; each heartbeat extends the claim by the
    /// queue's claim TTL.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Spawns the dequeue-execute loops into the join set.
#[allow(clippy::too_many_arguments)]
pub fn spawn_worker_pool(
    join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn WorkQueueService>,
    event_bus: Arc<dyn EventBus>,
    instance: &WorkerId,
    config: WorkerConfig,
    claim_extension: Duration,
    cancellation: CancellationToken,
) {
    for index in 0..config.worker_count {
        let worker_id = WorkerId::new(format!("{instance}-{index}"));
        let orchestrator = orchestrator.clone();
        let queue = queue.clone();
        let event_bus = event_bus.clone();
        let config = config.clone();
        let cancellation = cancellation.clone();
        join_set.spawn(async move {
            run_worker(
                orchestrator,
                queue,
                event_bus,
                worker_id,
                config,
                claim_extension,
                cancellation,
            )
            .await
        });
    }
}

async fn run_worker(
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn WorkQueueService>,
    event_bus: Arc<dyn EventBus>,
    worker_id: WorkerId,
    config: WorkerConfig,
    claim_extension: Duration,
    cancellation: CancellationToken,
) -> Result<(), anyhow::Error> {
    info!(worker_id = %worker_id, "worker started");
    loop {
        if cancellation.is_cancelled() {
            break;
        }
        let claimed = match queue.dequeue(&worker_id).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => continue,
                }
            }
            Err(err) => {
                warn!(worker_id = %worker_id, "dequeue failed: {err}");
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => continue,
                }
            }
        };

        let task_id = claimed.item.task_id;
        if let Err(err) = event_bus
            .publish(EventEnvelope::new(LifecycleEvent::TaskClaimed {
                task_id,
                worker_id: worker_id.clone(),
            }))
            .await
        {
            warn!(task_id = %task_id, "failed to publish TaskClaimed: {err}");
        }

        // Heartbeat while the orchestrator runs; stops by abort or once the
        // claim is gone.
        let heartbeat = {
            let queue = queue.clone();
            let worker_id = worker_id.clone();
            let interval = config.heartbeat_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    match queue.extend_claim(&task_id, &worker_id, claim_extension).await {
                        Ok(()) => {}
                        Err(QueueError::ClaimNotHeld { .. }) => break,
                        Err(err) => {
                            warn!(task_id = %task_id, "heartbeat failed: {err}");
                        }
                    }
                }
            })
        };

        orchestrator
            .execute(claimed, &worker_id, &cancellation)
            .await;
        heartbeat.abort();
    }
    info!(worker_id = %worker_id, "worker stopped");
    Ok(())
}

/// Rescues tasks from dead workers; runs at half the claim TTL.
pub async fn run_orphan_recovery(
    queue: Arc<dyn WorkQueueService>,
    claim_timeout: Duration,
    cancellation: CancellationToken,
) -> Result<(), anyhow::Error> {
    let interval_duration = claim_timeout / 2;
    let mut interval = tokio::time::interval(interval_duration.max(Duration::from_secs(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            _ = interval.tick() => {
                match queue.recover_orphans(claim_timeout).await {
                    Ok(0) => {}
                    Ok(recovered) => info!(recovered, "orphan recovery rescued tasks"),
                    Err(err) => warn!("orphan recovery failed: {err}"),
                }
                match queue.depth().await {
                    Ok(depth) => crate::metrics::record_queue_depth(depth),
                    Err(err) => warn!("queue depth probe failed: {err}"),
                }
            }
        }
    }
    Ok(())
}

/// Sweeps terminal task records past their retention.
pub async fn run_task_cleanup(
    task_service: Arc<dyn TaskService>,
    interval_duration: Duration,
    older_than: chrono::Duration,
    cancellation: CancellationToken,
) -> Result<(), anyhow::Error> {
    let mut interval = tokio::time::interval(interval_duration);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            _ = interval.tick() => {
                match task_service.cleanup(older_than).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "task cleanup removed terminal records"),
                    Err(err) => warn!("task cleanup failed: {err}"),
                }
            }
        }
    }
    Ok(())
}

/// Keeps this instance live in the statistics registry and evaluates alert
/// thresholds for the monitored regions. Unregisters on shutdown.
pub async fn run_stats_maintenance(
    stats: Arc<dyn CacheStatsService>,
    regions: Vec<Region>,
    heartbeat_interval: Duration,
    cancellation: CancellationToken,
) -> Result<(), anyhow::Error> {
    if let Err(err) = stats.heartbeat().await {
        warn!("initial stats heartbeat failed: {err}");
    }
    let mut interval = tokio::time::interval(heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            _ = interval.tick() => {
                if let Err(err) = stats.heartbeat().await {
                    warn!("stats heartbeat failed: {err}");
                }
                for region in &regions {
                    match stats.check_alerts(region).await {
                        Ok(alerts) => {
                            for alert in alerts {
                                warn!(
                                    region = %alert.region,
                                    alert_type = alert.alert_type.as_str(),
                                    "cache alert: {}", alert.message
                                );
                            }
                        }
                        Err(err) => warn!(region = %region, "alert check failed: {err}"),
                    }
                }
            }
        }
    }
    if let Err(err) = stats.unregister().await {
        warn!("stats unregister failed: {err}");
    }
    Ok(())
}

/// Drops expired quality samples and logs current recommendations.
pub async fn run_quality_maintenance(
    quality: Arc<crate::services::quality::QualityTracker>,
    interval_duration: Duration,
    cancellation: CancellationToken,
) -> Result<(), anyhow::Error> {
    let mut interval = tokio::time::interval(interval_duration);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            _ = interval.tick() => {
                let removed = quality.sweep_expired();
                if removed > 0 {
                    info!(removed, "dropped expired quality samples");
                }
                for recommendation in quality.recommendations() {
                    warn!(
                        axis = ?recommendation.axis,
                        key = %recommendation.key,
                        "quality recommendation: {}", recommendation.message
                    );
                }
            }
        }
    }
    Ok(())
}

/// The two resilience timers: periodic health checks and the slower
/// recovery/self-healing pass.
pub async fn run_resilience_timers(
    resilience: Arc<dyn ResilienceService>,
    config: ResilienceConfig,
    cancellation: CancellationToken,
) -> Result<(), anyhow::Error> {
    let mut health_interval = tokio::time::interval(config.health_check_interval);
    health_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut recovery_interval = tokio::time::interval(config.recovery_interval);
    recovery_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            _ = health_interval.tick() => {
                if let Err(err) = resilience.run_health_check().await {
                    warn!("health check pass failed: {err}");
                }
            }
            _ = recovery_interval.tick() => {
                if let Err(err) = resilience.run_recovery().await {
                    warn!("recovery pass failed: {err}");
                }
            }
        }
    }
    Ok(())
}
