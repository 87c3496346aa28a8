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

use crate::model::task::{Claim, ClaimedItem, StreamEntryRef, WorkItem};
use crate::storage::keyvalue::{KeyValueStorage, KeyValueStorageNamespace};
use crate::storage::stream::{StreamStorage, StreamStorageNamespace};
use crate::storage::{deserialize_entity, serialize_entity, StorageError};
use async_trait::async_trait;
use chrono::Utc;
use conduit_common::model::{Priority, TaskId, WorkerId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SVC_NAME: &str = "queue";
const KV_NS: KeyValueStorageNamespace = KeyValueStorageNamespace::Queue;
const STREAM_NS: StreamStorageNamespace = StreamStorageNamespace::WorkQueue;

pub const CONSUMER_GROUP: &str = "conduit-imagegen";

const RETRY_KEY: &str = "retry";
const ACTIVE_KEY: &str = "active";

/// Bound on how many due retry entries one dequeue call will contend for
/// before falling back to the stream.
const RETRY_DRAIN_ATTEMPTS: usize = 8;

/// TTL on the work-item scratch record; matches the task record's
/// non-terminal lifetime.
const ITEM_SCRATCH_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Claim on task {task_id} is not held by worker {worker_id}")]
    ClaimNotHeld {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkQueueConfig {
    /// Claim lease length; heartbeats extend it.
    #[serde(with = "humantime_serde")]
    pub claim_ttl: Duration,
    /// Delay applied by `return_to_queue` when the caller gives none.
    #[serde(with = "humantime_serde")]
    pub default_retry_delay: Duration,
    /// Delay applied to tasks rescued by orphan recovery.
    #[serde(with = "humantime_serde")]
    pub orphan_retry_delay: Duration,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            claim_ttl: Duration::from_secs(5 * 60),
            default_retry_delay: Duration::from_secs(30),
            orphan_retry_delay: Duration::from_secs(5),
        }
    }
}

fn stream_name(priority: Priority) -> &'static str {
    match priority {
        Priority::High => "stream:high",
        Priority::Normal => "stream",
        Priority::Low => "stream:low",
    }
}

fn claim_key(task_id: &TaskId) -> String {
    format!("claims:{task_id}")
}

fn item_key(task_id: &TaskId) -> String {
    format!("items:{task_id}")
}

/// Ordered at-least-once delivery of task ids to workers (C2): a stream per
/// priority class, a retry sorted set scored by eligibility time, and a claim
/// key per task with a TTL. Exactly-once is not claimed; the orchestrator's
/// side effects are idempotent per task id.
#[async_trait]
pub trait WorkQueueService: Send + Sync {
    async fn enqueue(&self, item: WorkItem) -> Result<(), QueueError>;

    /// Due retry items first (earliest eligibility), then the next unseen
    /// stream entry in priority order. Returns `None` when there is nothing
    /// claimable right now.
    async fn dequeue(&self, worker_id: &WorkerId) -> Result<Option<ClaimedItem>, QueueError>;

    /// Heartbeat: refreshes the claim's TTL. Fails if the claim is not held
    /// by the given worker.
    async fn extend_claim(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        extension: Duration,
    ) -> Result<(), QueueError>;

    /// Releases the claim and marks the work item done.
    async fn acknowledge(&self, task_id: &TaskId, worker_id: &WorkerId) -> Result<(), QueueError>;

    /// Releases the claim and schedules the task for another delivery at
    /// `now + retry_after` (the configured default when absent).
    async fn return_to_queue(
        &self,
        task_id: &TaskId,
        reason: &str,
        retry_after: Option<Duration>,
    ) -> Result<(), QueueError>;

    /// Schedules a task for redelivery at an absolute time; used by the
    /// orchestrator's backoff scheduling.
    async fn schedule_retry(
        &self,
        task_id: &TaskId,
        eligible_at: chrono::DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Rescues tasks whose claim expired or whose worker stopped
    /// heartbeating. Idempotent: rescued tasks leave the active set, so an
    /// immediate second call finds nothing to do.
    async fn recover_orphans(&self, claim_timeout: Duration) -> Result<u32, QueueError>;

    /// Entries waiting in the streams plus scheduled retries.
    async fn depth(&self) -> Result<u64, QueueError>;
}

pub struct WorkQueueServiceDefault {
    key_value_storage: Arc<dyn KeyValueStorage>,
    stream_storage: Arc<dyn StreamStorage>,
    config: WorkQueueConfig,
}

impl WorkQueueServiceDefault {
    pub fn new(
        key_value_storage: Arc<dyn KeyValueStorage>,
        stream_storage: Arc<dyn StreamStorage>,
        config: WorkQueueConfig,
    ) -> Self {
        Self {
            key_value_storage,
            stream_storage,
            config,
        }
    }

    async fn load_claim(
        &self,
        api_name: &'static str,
        task_id: &TaskId,
    ) -> Result<Option<Claim>, QueueError> {
        match self
            .key_value_storage
            .get(SVC_NAME, api_name, "claim", KV_NS, &claim_key(task_id))
            .await?
        {
            Some(bytes) => Ok(Some(deserialize_entity(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn held_claim(
        &self,
        api_name: &'static str,
        task_id: &TaskId,
        worker_id: &WorkerId,
    ) -> Result<Claim, QueueError> {
        match self.load_claim(api_name, task_id).await? {
            Some(claim) if claim.worker_id == *worker_id => Ok(claim),
            _ => Err(QueueError::ClaimNotHeld {
                task_id: *task_id,
                worker_id: worker_id.clone(),
            }),
        }
    }

    /// Set-if-absent on the claim key; `None` when another worker holds it.
    async fn try_claim(
        &self,
        worker_id: &WorkerId,
        item: &WorkItem,
        stream_entry: Option<StreamEntryRef>,
    ) -> Result<Option<Claim>, QueueError> {
        let now = Utc::now();
        let claim = Claim {
            task_id: item.task_id,
            worker_id: worker_id.clone(),
            claimed_at: now,
            last_heartbeat: now,
            item: item.clone(),
            stream_entry,
        };
        let bytes = serialize_entity(SVC_NAME, "claim", &claim)?;
        let acquired = self
            .key_value_storage
            .set_if_absent(
                SVC_NAME,
                "dequeue",
                "claim",
                KV_NS,
                &claim_key(&item.task_id),
                &bytes,
                self.config.claim_ttl,
            )
            .await?;
        if acquired {
            self.key_value_storage
                .add_to_set(
                    SVC_NAME,
                    "dequeue",
                    KV_NS,
                    ACTIVE_KEY,
                    &item.task_id.to_string(),
                )
                .await?;
            crate::metrics::record_claim_acquired();
            Ok(Some(claim))
        } else {
            Ok(None)
        }
    }

    async fn load_item(&self, task_id: &TaskId) -> Result<Option<WorkItem>, QueueError> {
        match self
            .key_value_storage
            .get(SVC_NAME, "dequeue", "work-item", KV_NS, &item_key(task_id))
            .await?
        {
            Some(bytes) => Ok(Some(deserialize_entity(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn schedule_at(
        &self,
        api_name: &'static str,
        task_id: &TaskId,
        eligible_at: chrono::DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.key_value_storage
            .add_to_sorted_set(
                SVC_NAME,
                api_name,
                KV_NS,
                RETRY_KEY,
                eligible_at.timestamp_millis() as f64,
                &task_id.to_string(),
            )
            .await?;
        Ok(())
    }

    async fn dequeue_due_retry(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Option<ClaimedItem>, QueueError> {
        let now_millis = Utc::now().timestamp_millis() as f64;
        for _ in 0..RETRY_DRAIN_ATTEMPTS {
            let due = self
                .key_value_storage
                .sorted_set_range_by_score(
                    SVC_NAME,
                    "dequeue",
                    KV_NS,
                    RETRY_KEY,
                    f64::MIN,
                    now_millis,
                    1,
                )
                .await?;
            let member = match due.first() {
                Some(member) => member.clone(),
                None => return Ok(None),
            };
            // zrem decides which instance wins the entry.
            let won = self
                .key_value_storage
                .remove_from_sorted_set(SVC_NAME, "dequeue", KV_NS, RETRY_KEY, &member)
                .await?;
            if !won {
                continue;
            }
            let task_id = match member.parse::<TaskId>() {
                Ok(task_id) => task_id,
                Err(_) => {
                    warn!(member = %member, "dropping malformed retry entry");
                    continue;
                }
            };
            let item = match self.load_item(&task_id).await? {
                Some(item) => item,
                None => {
                    warn!(task_id = %task_id, "retry entry without work item, dropping");
                    continue;
                }
            };
            match self.try_claim(worker_id, &item, None).await? {
                Some(claim) => {
                    return Ok(Some(ClaimedItem { item, claim }));
                }
                None => {
                    // Someone is still working on it; look again after their
                    // claim can have expired.
                    self.schedule_at(
                        "dequeue",
                        &task_id,
                        Utc::now() + self.config.claim_ttl,
                    )
                    .await?;
                }
            }
        }
        Ok(None)
    }

    async fn dequeue_from_streams(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Option<ClaimedItem>, QueueError> {
        for priority in Priority::ALL {
            let stream = stream_name(priority);
            let entries = self
                .stream_storage
                .read_group(
                    SVC_NAME,
                    "dequeue",
                    STREAM_NS,
                    stream,
                    CONSUMER_GROUP,
                    worker_id.as_str(),
                    1,
                )
                .await?;
            let entry = match entries.into_iter().next() {
                Some(entry) => entry,
                None => continue,
            };
            let item: WorkItem = deserialize_entity(&entry.payload)?;
            let stream_entry = StreamEntryRef {
                priority,
                entry_id: entry.id.clone(),
            };
            match self.try_claim(worker_id, &item, Some(stream_entry)).await? {
                Some(claim) => return Ok(Some(ClaimedItem { item, claim })),
                None => {
                    // Another instance won the claim; the offset is consumed
                    // so the entry is not replayed here, and this call yields.
                    self.stream_storage
                        .ack(SVC_NAME, "dequeue", STREAM_NS, stream, CONSUMER_GROUP, &entry.id)
                        .await?;
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    async fn release_claim(&self, claim: &Claim, api_name: &'static str) -> Result<(), QueueError> {
        if let Some(stream_entry) = &claim.stream_entry {
            self.stream_storage
                .ack(
                    SVC_NAME,
                    api_name,
                    STREAM_NS,
                    stream_name(stream_entry.priority),
                    CONSUMER_GROUP,
                    &stream_entry.entry_id,
                )
                .await?;
        }
        self.key_value_storage
            .del(SVC_NAME, api_name, KV_NS, &claim_key(&claim.task_id))
            .await?;
        self.key_value_storage
            .remove_from_set(
                SVC_NAME,
                api_name,
                KV_NS,
                ACTIVE_KEY,
                &claim.task_id.to_string(),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueueService for WorkQueueServiceDefault {
    async fn enqueue(&self, item: WorkItem) -> Result<(), QueueError> {
        let item_bytes = serialize_entity(SVC_NAME, "work-item", &item)?;
        self.key_value_storage
            .set(
                SVC_NAME,
                "enqueue",
                "work-item",
                KV_NS,
                &item_key(&item.task_id),
                &item_bytes,
                Some(ITEM_SCRATCH_TTL),
            )
            .await?;
        let stream = stream_name(item.priority);
        self.stream_storage
            .ensure_group(SVC_NAME, "enqueue", STREAM_NS, stream, CONSUMER_GROUP)
            .await?;
        self.stream_storage
            .append(SVC_NAME, "enqueue", "work-item", STREAM_NS, stream, &item_bytes)
            .await?;
        crate::metrics::record_enqueued(item.priority);
        debug!(task_id = %item.task_id, priority = %item.priority, "enqueued work item");
        Ok(())
    }

    async fn dequeue(&self, worker_id: &WorkerId) -> Result<Option<ClaimedItem>, QueueError> {
        if let Some(claimed) = self.dequeue_due_retry(worker_id).await? {
            return Ok(Some(claimed));
        }
        self.dequeue_from_streams(worker_id).await
    }

    async fn extend_claim(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        extension: Duration,
    ) -> Result<(), QueueError> {
        let mut claim = self.held_claim("extend-claim", task_id, worker_id).await?;
        claim.last_heartbeat = Utc::now();
        let bytes = serialize_entity(SVC_NAME, "claim", &claim)?;
        self.key_value_storage
            .set(
                SVC_NAME,
                "extend-claim",
                "claim",
                KV_NS,
                &claim_key(task_id),
                &bytes,
                Some(extension),
            )
            .await?;
        Ok(())
    }

    async fn acknowledge(&self, task_id: &TaskId, worker_id: &WorkerId) -> Result<(), QueueError> {
        let claim = self.held_claim("acknowledge", task_id, worker_id).await?;
        self.release_claim(&claim, "acknowledge").await?;
        self.key_value_storage
            .del(SVC_NAME, "acknowledge", KV_NS, &item_key(task_id))
            .await?;
        Ok(())
    }

    async fn return_to_queue(
        &self,
        task_id: &TaskId,
        reason: &str,
        retry_after: Option<Duration>,
    ) -> Result<(), QueueError> {
        if let Some(claim) = self.load_claim("return-to-queue", task_id).await? {
            self.release_claim(&claim, "return-to-queue").await?;
        }
        let delay = retry_after.unwrap_or(self.config.default_retry_delay);
        self.schedule_at("return-to-queue", task_id, Utc::now() + delay)
            .await?;
        debug!(task_id = %task_id, reason, "returned task to queue");
        Ok(())
    }

    async fn schedule_retry(
        &self,
        task_id: &TaskId,
        eligible_at: chrono::DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.schedule_at("schedule-retry", task_id, eligible_at)
            .await
    }

    async fn recover_orphans(&self, claim_timeout: Duration) -> Result<u32, QueueError> {
        let active = self
            .key_value_storage
            .members_of_set(SVC_NAME, "recover-orphans", KV_NS, ACTIVE_KEY)
            .await?;
        let stale_before = Utc::now()
            - chrono::Duration::from_std(claim_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut recovered = 0;

        for member in active {
            let task_id = match member.parse::<TaskId>() {
                Ok(task_id) => task_id,
                Err(_) => continue,
            };
            let orphaned = match self.load_claim("recover-orphans", &task_id).await? {
                // Claim key evicted by TTL: the worker is gone.
                None => true,
                Some(claim) if claim.last_heartbeat < stale_before => {
                    self.release_claim(&claim, "recover-orphans").await?;
                    true
                }
                Some(_) => false,
            };
            if orphaned {
                self.key_value_storage
                    .remove_from_set(SVC_NAME, "recover-orphans", KV_NS, ACTIVE_KEY, &member)
                    .await?;
                self.schedule_at(
                    "recover-orphans",
                    &task_id,
                    Utc::now() + self.config.orphan_retry_delay,
                )
                .await?;
                crate::metrics::record_orphan_recovered();
                warn!(task_id = %task_id, "recovered orphaned task");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut depth = self
            .key_value_storage
            .sorted_set_cardinality(SVC_NAME, "depth", KV_NS, RETRY_KEY)
            .await?;
        for priority in Priority::ALL {
            depth += self
                .stream_storage
                .length(SVC_NAME, "depth", STREAM_NS, stream_name(priority))
                .await?;
        }
        Ok(depth)
    }
}
