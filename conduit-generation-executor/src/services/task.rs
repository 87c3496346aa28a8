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

use crate::model::task::Task;
use crate::storage::keyvalue::{KeyValueStorage, KeyValueStorageNamespace};
use crate::storage::{deserialize_entity, serialize_entity, StorageError};
use async_trait::async_trait;
use chrono::Utc;
use conduit_common::model::{CorrelationId, TaskId, TaskState, TaskType, VirtualKeyId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SVC_NAME: &str = "tasks";
const NS: KeyValueStorageNamespace = KeyValueStorageNamespace::Tasks;
const INDEX_KEY: &str = "index";

/// Record TTL while work may still happen.
pub const NON_TERMINAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Record TTL once terminal, long enough for completed-task polling.
pub const TERMINAL_TTL: Duration = Duration::from_secs(2 * 60 * 60);

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Version-fenced writes retry this often before reporting a conflict.
const CAS_ATTEMPTS: u32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),
    #[error("Invalid state transition for task {task_id}: {from} -> {to}")]
    InvalidStateTransition {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
    },
    #[error("Concurrent modification of task {0}")]
    ConcurrentModification(TaskId),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct CreateTaskRequest {
    pub task_type: TaskType,
    pub virtual_key_id: VirtualKeyId,
    pub payload: serde_json::Value,
    pub webhook_url: Option<String>,
    pub webhook_headers: Option<HashMap<String, String>>,
    pub correlation_id: Option<CorrelationId>,
    pub max_retries: Option<u32>,
}

/// Durable task records (C1). All writes are keyed by task id and use
/// compare-and-swap on the record's version, so the state transition rules
/// hold against what is actually stored at write time, not against a stale
/// snapshot. The work queue's claim keeps the common path contention-free;
/// the fence is what makes duplicate executions safe.
#[async_trait]
pub trait TaskService: Send + Sync {
    async fn create(&self, request: CreateTaskRequest) -> Result<Task, TaskError>;

    /// Absent means evicted or never known; callers treat it as terminal
    /// unknown, never as pending work.
    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, TaskError>;

    /// Repeating the current terminal state, or re-entering the current
    /// non-terminal state (a rescued task going Processing again), is an
    /// idempotent no-op success.
    async fn update_state(
        &self,
        task_id: &TaskId,
        new_state: TaskState,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<Task, TaskError>;

    /// Terminal transition that must be won: unlike [`update_state`], a task
    /// that is already terminal is a conflict, never an idempotent success.
    /// When duplicate executions of one task race here, exactly one caller
    /// gets `Ok`; everyone else gets `InvalidStateTransition` and discards
    /// their side effects.
    async fn update_state_exclusive(
        &self,
        task_id: &TaskId,
        new_state: TaskState,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<Task, TaskError>;

    async fn update_progress(
        &self,
        task_id: &TaskId,
        progress: u8,
        message: Option<String>,
    ) -> Result<Task, TaskError>;

    /// Moves a Processing task back to Pending for another attempt,
    /// incrementing the persisted retry counter.
    async fn record_retry(
        &self,
        task_id: &TaskId,
        next_retry_at: chrono::DateTime<Utc>,
    ) -> Result<Task, TaskError>;

    async fn delete(&self, task_id: &TaskId) -> Result<(), TaskError>;

    /// Sweeps terminal records older than the threshold; returns how many
    /// were removed. Per-record failures are logged and skipped.
    async fn cleanup(&self, older_than: chrono::Duration) -> Result<u64, TaskError>;

    async fn active_ids(&self) -> Result<Vec<TaskId>, TaskError>;
}

pub struct TaskServiceDefault {
    key_value_storage: Arc<dyn KeyValueStorage>,
}

impl TaskServiceDefault {
    pub fn new(key_value_storage: Arc<dyn KeyValueStorage>) -> Self {
        Self { key_value_storage }
    }

    async fn write(&self, api_name: &'static str, task: &Task) -> Result<(), TaskError> {
        let ttl = if task.is_terminal() {
            TERMINAL_TTL
        } else {
            NON_TERMINAL_TTL
        };
        let bytes = serialize_entity(SVC_NAME, "task", task)?;
        self.key_value_storage
            .set(
                SVC_NAME,
                api_name,
                "task",
                NS,
                &task.id.to_string(),
                &bytes,
                Some(ttl),
            )
            .await?;
        Ok(())
    }

    async fn load(&self, api_name: &'static str, task_id: &TaskId) -> Result<Task, TaskError> {
        match self
            .key_value_storage
            .get(SVC_NAME, api_name, "task", NS, &task_id.to_string())
            .await?
        {
            Some(bytes) => Ok(deserialize_entity(&bytes)?),
            None => Err(TaskError::NotFound(*task_id)),
        }
    }

    fn check_transition(task: &Task, new_state: TaskState) -> Result<(), TaskError> {
        if task.can_transition_to(new_state) {
            Ok(())
        } else {
            Err(TaskError::InvalidStateTransition {
                task_id: task.id,
                from: task.state,
                to: new_state,
            })
        }
    }

    /// Version-fenced write: lands only while the stored record still carries
    /// `expected_version`. `task.version` must already be the bumped value.
    async fn write_fenced(
        &self,
        api_name: &'static str,
        task: &Task,
        expected_version: u64,
    ) -> Result<bool, TaskError> {
        let ttl = if task.is_terminal() {
            TERMINAL_TTL
        } else {
            NON_TERMINAL_TTL
        };
        let bytes = serialize_entity(SVC_NAME, "task", task)?;
        Ok(self
            .key_value_storage
            .set_if_version(
                SVC_NAME,
                api_name,
                "task",
                NS,
                &task.id.to_string(),
                &bytes,
                expected_version,
                Some(ttl),
            )
            .await?)
    }

    /// The load -> validate -> fenced-write loop behind both state-update
    /// flavors. A lost swap reloads and re-validates against the winner's
    /// record, so a transition that raced a terminal write surfaces as
    /// `InvalidStateTransition`, never as a silent double-apply.
    async fn apply_state(
        &self,
        task_id: &TaskId,
        new_state: TaskState,
        result: Option<serde_json::Value>,
        error: Option<String>,
        idempotent_terminal: bool,
    ) -> Result<Task, TaskError> {
        let mut attempt = 1;
        loop {
            let mut task = self.load("update-state", task_id).await?;

            if task.state == new_state {
                if !task.state.is_terminal() {
                    // Re-entering the current non-terminal state (rescued
                    // Processing work, a shutdown reset to Pending) changes
                    // nothing.
                    return Ok(task);
                }
                // Only the first look may treat a repeated terminal state as
                // idempotent; after a lost swap it means another writer won.
                if idempotent_terminal && attempt == 1 {
                    return Ok(task);
                }
            }
            Self::check_transition(&task, new_state)?;

            let now = Utc::now();
            let expected_version = task.version;
            task.version += 1;
            task.state = new_state;
            task.updated_at = now;
            if new_state.is_terminal() {
                task.completed_at = Some(now);
                task.next_retry_at = None;
            }
            match new_state {
                TaskState::Completed => {
                    task.progress = 100;
                    task.result = result.clone();
                    task.error = None;
                }
                TaskState::Failed | TaskState::TimedOut => {
                    task.result = None;
                    task.error = error.clone();
                }
                TaskState::Cancelled => {
                    task.result = None;
                }
                _ => {}
            }

            if self
                .write_fenced("update-state", &task, expected_version)
                .await?
            {
                crate::metrics::record_task_transition(new_state);
                return Ok(task);
            }
            if attempt >= CAS_ATTEMPTS {
                return Err(TaskError::ConcurrentModification(*task_id));
            }
            attempt += 1;
        }
    }
}

#[async_trait]
impl TaskService for TaskServiceDefault {
    async fn create(&self, request: CreateTaskRequest) -> Result<Task, TaskError> {
        let now = Utc::now();
        let task = Task {
            id: TaskId::generate(),
            version: 1,
            task_type: request.task_type,
            virtual_key_id: request.virtual_key_id,
            payload: request.payload,
            state: TaskState::Pending,
            progress: 0,
            progress_message: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            next_retry_at: None,
            webhook_url: request.webhook_url,
            webhook_headers: request.webhook_headers,
            correlation_id: request.correlation_id.unwrap_or_else(CorrelationId::new_v4),
        };
        self.write("create", &task).await?;
        self.key_value_storage
            .add_to_set(SVC_NAME, "create", NS, INDEX_KEY, &task.id.to_string())
            .await?;
        debug!(task_id = %task.id, task_type = %task.task_type, "created task");
        Ok(task)
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, TaskError> {
        match self
            .key_value_storage
            .get(SVC_NAME, "get", "task", NS, &task_id.to_string())
            .await?
        {
            Some(bytes) => Ok(Some(deserialize_entity(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn update_state(
        &self,
        task_id: &TaskId,
        new_state: TaskState,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<Task, TaskError> {
        self.apply_state(task_id, new_state, result, error, true)
            .await
    }

    async fn update_state_exclusive(
        &self,
        task_id: &TaskId,
        new_state: TaskState,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<Task, TaskError> {
        self.apply_state(task_id, new_state, result, error, false)
            .await
    }

    async fn update_progress(
        &self,
        task_id: &TaskId,
        progress: u8,
        message: Option<String>,
    ) -> Result<Task, TaskError> {
        let mut attempt = 1;
        loop {
            let mut task = self.load("update-progress", task_id).await?;
            if task.state.is_terminal() {
                return Err(TaskError::Validation(format!(
                    "cannot update progress of task {task_id} in state {}",
                    task.state
                )));
            }
            let expected_version = task.version;
            task.version += 1;
            task.progress = progress.min(100);
            task.progress_message = message.clone();
            task.updated_at = Utc::now();
            if self
                .write_fenced("update-progress", &task, expected_version)
                .await?
            {
                return Ok(task);
            }
            if attempt >= CAS_ATTEMPTS {
                return Err(TaskError::ConcurrentModification(*task_id));
            }
            attempt += 1;
        }
    }

    async fn record_retry(
        &self,
        task_id: &TaskId,
        next_retry_at: chrono::DateTime<Utc>,
    ) -> Result<Task, TaskError> {
        let mut attempt = 1;
        loop {
            let mut task = self.load("record-retry", task_id).await?;
            Self::check_transition(&task, TaskState::Pending)?;
            let expected_version = task.version;
            task.version += 1;
            task.state = TaskState::Pending;
            task.retry_count += 1;
            task.next_retry_at = Some(next_retry_at);
            task.updated_at = Utc::now();
            if self
                .write_fenced("record-retry", &task, expected_version)
                .await?
            {
                return Ok(task);
            }
            if attempt >= CAS_ATTEMPTS {
                return Err(TaskError::ConcurrentModification(*task_id));
            }
            attempt += 1;
        }
    }

    async fn delete(&self, task_id: &TaskId) -> Result<(), TaskError> {
        self.key_value_storage
            .del(SVC_NAME, "delete", NS, &task_id.to_string())
            .await?;
        self.key_value_storage
            .remove_from_set(SVC_NAME, "delete", NS, INDEX_KEY, &task_id.to_string())
            .await?;
        Ok(())
    }

    async fn cleanup(&self, older_than: chrono::Duration) -> Result<u64, TaskError> {
        let ids = self
            .key_value_storage
            .members_of_set(SVC_NAME, "cleanup", NS, INDEX_KEY)
            .await?;
        let threshold = Utc::now() - older_than;
        let mut removed = 0;
        for id in ids {
            let task_id = match id.parse::<TaskId>() {
                Ok(task_id) => task_id,
                Err(_) => continue,
            };
            match self.get(&task_id).await {
                Ok(None) => {
                    // Evicted by TTL; drop the dangling index entry.
                    if let Err(err) = self
                        .key_value_storage
                        .remove_from_set(SVC_NAME, "cleanup", NS, INDEX_KEY, &id)
                        .await
                    {
                        warn!(task_id = %task_id, "cleanup failed to drop index entry: {err}");
                    }
                }
                Ok(Some(task)) if task.is_terminal() && task.updated_at < threshold => {
                    match self.delete(&task_id).await {
                        Ok(()) => removed += 1,
                        Err(err) => {
                            warn!(task_id = %task_id, "cleanup failed to delete task: {err}")
                        }
                    }
                }
                Ok(Some(_)) => {}
                Err(err) => {
                    warn!(task_id = %task_id, "cleanup failed to read task: {err}");
                }
            }
        }
        Ok(removed)
    }

    async fn active_ids(&self) -> Result<Vec<TaskId>, TaskError> {
        let ids = self
            .key_value_storage
            .members_of_set(SVC_NAME, "active-ids", NS, INDEX_KEY)
            .await?;
        Ok(ids.into_iter().filter_map(|id| id.parse().ok()).collect())
    }
}
