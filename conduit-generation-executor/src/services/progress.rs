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

//! Synthetic progress reporting (C10) for tasks whose provider reports no
//! native progress (third-party video generation, mostly): checkpoints at
//! 10/30/50/70/90 percent, spaced by elapsed time, with automatic
//! cancellation once the task leaves Processing.

use crate::model::event::{EventEnvelope, LifecycleEvent, WebhookEventType};
use crate::services::events::EventBus;
use crate::services::task::TaskService;
use conduit_common::model::{TaskId, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHECKPOINTS: [u8; 5] = [10, 30, 50, 70, 90];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressTrackerConfig {
    /// How often in-flight tasks are checked.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Elapsed time per synthetic checkpoint.
    #[serde(with = "humantime_serde")]
    pub interval_spacing: Duration,
}

impl Default for ProgressTrackerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            interval_spacing: Duration::from_secs(30),
        }
    }
}

struct Tracking {
    started_at: Instant,
    next_checkpoint: usize,
}

pub struct ProgressTracker {
    task_service: Arc<dyn TaskService>,
    event_bus: Arc<dyn EventBus>,
    config: ProgressTrackerConfig,
    tracked: Mutex<HashMap<TaskId, Tracking>>,
}

impl ProgressTracker {
    pub fn new(
        task_service: Arc<dyn TaskService>,
        event_bus: Arc<dyn EventBus>,
        config: ProgressTrackerConfig,
    ) -> Self {
        Self {
            task_service,
            event_bus,
            config,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    pub fn track(&self, task_id: TaskId) {
        let mut tracked = self.tracked.lock().unwrap();
        tracked.entry(task_id).or_insert(Tracking {
            started_at: Instant::now(),
            next_checkpoint: 0,
        });
    }

    pub fn untrack(&self, task_id: &TaskId) {
        let mut tracked = self.tracked.lock().unwrap();
        tracked.remove(task_id);
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().unwrap().len()
    }

    async fn publish(&self, event: LifecycleEvent) {
        if let Err(err) = self.event_bus.publish(EventEnvelope::new(event)).await {
            warn!("failed to publish progress event: {err}");
        }
    }

    /// One evaluation pass over all tracked tasks.
    pub async fn tick(&self) {
        let snapshot: Vec<(TaskId, Duration, usize)> = {
            let tracked = self.tracked.lock().unwrap();
            tracked
                .iter()
                .map(|(task_id, tracking)| {
                    (
                        *task_id,
                        tracking.started_at.elapsed(),
                        tracking.next_checkpoint,
                    )
                })
                .collect()
        };

        for (task_id, elapsed, next_checkpoint) in snapshot {
            self.publish(LifecycleEvent::ProgressCheckRequested { task_id })
                .await;

            let task = match self.task_service.get(&task_id).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    self.untrack(&task_id);
                    continue;
                }
                Err(err) => {
                    warn!(task_id = %task_id, "progress check failed to load task: {err}");
                    continue;
                }
            };

            if task.state != TaskState::Processing {
                debug!(task_id = %task_id, state = %task.state, "stopping progress tracking");
                self.untrack(&task_id);
                self.publish(LifecycleEvent::ProgressTrackingCancelled { task_id })
                    .await;
                continue;
            }

            if next_checkpoint >= CHECKPOINTS.len() {
                continue;
            }
            let due_after = self
                .config
                .interval_spacing
                .mul_f64((next_checkpoint + 1) as f64);
            if elapsed < due_after {
                continue;
            }

            let progress = CHECKPOINTS[next_checkpoint];
            let message = format!("generation in progress ({progress}%)");
            let updated = match self
                .task_service
                .update_progress(&task_id, progress, Some(message.clone()))
                .await
            {
                Ok(updated) => updated,
                Err(err) => {
                    warn!(task_id = %task_id, "failed to update synthetic progress: {err}");
                    continue;
                }
            };

            {
                let mut tracked = self.tracked.lock().unwrap();
                if let Some(tracking) = tracked.get_mut(&task_id) {
                    tracking.next_checkpoint = next_checkpoint + 1;
                }
            }

            self.publish(LifecycleEvent::TaskProgress {
                task_id,
                progress,
                message: Some(message),
            })
            .await;

            if updated.webhook_url.is_some() {
                let remaining_checkpoints = CHECKPOINTS.len() - next_checkpoint - 1;
                let estimated_seconds_remaining =
                    self.config.interval_spacing.as_secs() * remaining_checkpoints as u64;
                self.publish(LifecycleEvent::WebhookDeliveryRequested {
                    task_id,
                    event_type: WebhookEventType::TaskProgress,
                    context: serde_json::json!({
                        "estimated_seconds_remaining": estimated_seconds_remaining,
                    }),
                })
                .await;
            }
        }
    }

    /// Runs ticks until cancelled.
    pub async fn run(&self, cancellation: CancellationToken) -> Result<(), anyhow::Error> {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
        Ok(())
    }
}
