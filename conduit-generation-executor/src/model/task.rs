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
use conduit_common::model::{CorrelationId, Priority, TaskId, TaskState, TaskType, VirtualKeyId, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The durable task record, the system of record for one unit of generation
/// work. Claims and work items only ever carry the task id; there are no
/// back-pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Write fence: bumped by every store write, checked by the store's
    /// compare-and-swap so concurrent writers cannot clobber each other.
    pub version: u64,
    pub task_type: TaskType,
    pub virtual_key_id: VirtualKeyId,
    pub payload: serde_json::Value,
    pub state: TaskState,
    pub progress: u8,
    pub progress_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub webhook_url: Option<String>,
    pub webhook_headers: Option<HashMap<String, String>>,
    pub correlation_id: CorrelationId,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// State transition rules: terminal states are absorbing, Processing can
    /// fall back to Pending for a retry cycle, everything else moves forward.
    pub fn can_transition_to(&self, new_state: TaskState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        match (self.state, new_state) {
            (TaskState::Pending, TaskState::Processing) => true,
            (TaskState::Pending, s) if s.is_terminal() => true,
            (TaskState::Processing, TaskState::Pending) => true,
            (TaskState::Processing, s) if s.is_terminal() => true,
            _ => false,
        }
    }

    /// The request payload, unwrapping the legacy shape where the original
    /// metadata is nested under `originalMetadata`.
    pub fn request_payload(&self) -> &serde_json::Value {
        match self.payload.get("originalMetadata") {
            Some(inner) => inner,
            None => &self.payload,
        }
    }
}

/// A short-lived lease giving one worker exclusive mutation rights over one
/// task. Stored under a key with a TTL; liveness is renewed by heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub item: WorkItem,
    /// Stream entry to acknowledge on completion; absent when the item was
    /// delivered from the retry set.
    pub stream_entry: Option<StreamEntryRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntryRef {
    pub priority: Priority,
    pub entry_id: String,
}

/// What travels through the queue: the task id plus scheduling fields only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub task_id: TaskId,
    pub priority: Priority,
    pub virtual_key_id: VirtualKeyId,
}

/// A successfully claimed work item, as handed to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedItem {
    pub item: WorkItem,
    pub claim: Claim,
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn task(state: TaskState) -> Task {
        Task {
            id: TaskId::generate(),
            version: 1,
            task_type: TaskType::Video,
            virtual_key_id: VirtualKeyId::new("vk-1"),
            payload: serde_json::json!({"prompt": "a cat"}),
            state,
            progress: 0,
            progress_message: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            webhook_url: None,
            webhook_headers: None,
            correlation_id: CorrelationId::new_v4(),
        }
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for terminal in [
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Cancelled,
            TaskState::TimedOut,
        ] {
            let task = task(terminal);
            assert!(!task.can_transition_to(TaskState::Pending));
            assert!(!task.can_transition_to(TaskState::Processing));
            assert!(!task.can_transition_to(TaskState::Completed));
        }
    }

    #[test]
    fn retry_cycle_is_allowed() {
        assert!(task(TaskState::Processing).can_transition_to(TaskState::Pending));
        assert!(task(TaskState::Pending).can_transition_to(TaskState::Processing));
        assert!(!task(TaskState::Pending).can_transition_to(TaskState::Pending));
    }

    #[test]
    fn legacy_metadata_wrapper_is_unwrapped() {
        let mut wrapped = task(TaskState::Pending);
        wrapped.payload =
            serde_json::json!({"originalMetadata": {"prompt": "a dog"}, "schemaVersion": 1});
        assert_eq!(
            wrapped.request_payload(),
            &serde_json::json!({"prompt": "a dog"})
        );

        let plain = task(TaskState::Pending);
        assert_eq!(plain.request_payload(), &plain.payload);
    }
}
