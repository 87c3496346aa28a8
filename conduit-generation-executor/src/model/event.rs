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

use crate::model::cost::CostResult;
use chrono::{DateTime, Utc};
use conduit_common::model::{
    CorrelationId, ProviderId, Region, TaskId, TaskType, VirtualKeyId, WorkerId,
};
use serde::{Deserialize, Serialize};

/// Outbound webhook notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEventType {
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskProgress,
}

impl WebhookEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventType::TaskCompleted => "TaskCompleted",
            WebhookEventType::TaskFailed => "TaskFailed",
            WebhookEventType::TaskCancelled => "TaskCancelled",
            WebhookEventType::TaskProgress => "TaskProgress",
        }
    }
}

/// Lifecycle events published on the bus. Delivery is at-least-once and the
/// bus is not the system of record: every consumer can reconcile by reading
/// the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "PascalCase")]
pub enum LifecycleEvent {
    TaskCreated {
        task_id: TaskId,
        task_type: TaskType,
        virtual_key_id: VirtualKeyId,
    },
    TaskClaimed {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    TaskProgress {
        task_id: TaskId,
        progress: u8,
        message: Option<String>,
    },
    TaskCompleted {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
        will_retry: bool,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    ProgressCheckRequested {
        task_id: TaskId,
    },
    ProgressTrackingCancelled {
        task_id: TaskId,
    },
    ProviderQuarantined {
        provider: ProviderId,
        reason: String,
    },
    ProviderFailoverInitiated {
        failed_provider: ProviderId,
        failover_provider: Option<ProviderId>,
    },
    ProviderRecoveryInitiated {
        provider: ProviderId,
    },
    ProviderFailoverReverted {
        original_provider: ProviderId,
    },
    MediaGenerationCompleted {
        task_id: TaskId,
        storage_key: String,
        size_bytes: u64,
    },
    WebhookDeliveryRequested {
        task_id: TaskId,
        event_type: WebhookEventType,
        context: serde_json::Value,
    },
    CacheStatisticsUpdate {
        region: Region,
        metric: String,
        delta: i64,
    },
    CacheAlert {
        region: Region,
        alert_type: String,
        message: String,
    },
    /// Charge submission towards the external ledger; the task id doubles as
    /// the idempotency key so a replay after a claim-expiry race cannot
    /// double-charge.
    ChargeSubmitted {
        task_id: TaskId,
        virtual_key_id: VirtualKeyId,
        cost: CostResult,
    },
}

impl LifecycleEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            LifecycleEvent::TaskCreated { .. } => "TaskCreated",
            LifecycleEvent::TaskClaimed { .. } => "TaskClaimed",
            LifecycleEvent::TaskProgress { .. } => "TaskProgress",
            LifecycleEvent::TaskCompleted { .. } => "TaskCompleted",
            LifecycleEvent::TaskFailed { .. } => "TaskFailed",
            LifecycleEvent::TaskCancelled { .. } => "TaskCancelled",
            LifecycleEvent::ProgressCheckRequested { .. } => "ProgressCheckRequested",
            LifecycleEvent::ProgressTrackingCancelled { .. } => "ProgressTrackingCancelled",
            LifecycleEvent::ProviderQuarantined { .. } => "ProviderQuarantined",
            LifecycleEvent::ProviderFailoverInitiated { .. } => "ProviderFailoverInitiated",
            LifecycleEvent::ProviderRecoveryInitiated { .. } => "ProviderRecoveryInitiated",
            LifecycleEvent::ProviderFailoverReverted { .. } => "ProviderFailoverReverted",
            LifecycleEvent::MediaGenerationCompleted { .. } => "MediaGenerationCompleted",
            LifecycleEvent::WebhookDeliveryRequested { .. } => "WebhookDeliveryRequested",
            LifecycleEvent::CacheStatisticsUpdate { .. } => "CacheStatisticsUpdate",
            LifecycleEvent::CacheAlert { .. } => "CacheAlert",
            LifecycleEvent::ChargeSubmitted { .. } => "ChargeSubmitted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Option<CorrelationId>,
    pub event: LifecycleEvent,
}

impl EventEnvelope {
    pub fn new(event: LifecycleEvent) -> Self {
        Self {
            occurred_at: Utc::now(),
            correlation_id: None,
            event,
        }
    }

    pub fn correlated(event: LifecycleEvent, correlation_id: CorrelationId) -> Self {
        Self {
            occurred_at: Utc::now(),
            correlation_id: Some(correlation_id),
            event,
        }
    }
}
