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
use conduit_common::model::ProviderId;
use serde::{Deserialize, Serialize};

/// Provider health state machine. `PermanentlyFailed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderState {
    Healthy,
    Throttled,
    Quarantined,
    Recovering,
    PermanentlyFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: ProviderId,
    pub state: ProviderState,
    /// 0.0..=1.0; feeds routing weights.
    pub health_score: f64,
    pub consecutive_failures: u32,
    pub quarantined_at: Option<DateTime<Utc>>,
    pub quarantine_reason: Option<String>,
    /// Fraction of normal traffic this provider receives. 1.0 = full.
    pub throttle_level: f64,
    pub recovery_started: Option<DateTime<Utc>>,
    pub last_transition: DateTime<Utc>,
}

impl ProviderHealth {
    pub fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            state: ProviderState::Healthy,
            health_score: 1.0,
            consecutive_failures: 0,
            quarantined_at: None,
            quarantine_reason: None,
            throttle_level: 1.0,
            recovery_started: None,
            last_transition: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.state, ProviderState::Healthy | ProviderState::Throttled)
    }

    /// Whether any traffic at all may be routed to this provider.
    pub fn accepts_traffic(&self) -> bool {
        !matches!(
            self.state,
            ProviderState::Quarantined | ProviderState::PermanentlyFailed
        ) && self.throttle_level > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverStatus {
    Initiated,
    Active,
    Recovering,
    Completed,
    NoAlternative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverRecord {
    pub failed_provider: ProviderId,
    pub failover_provider: Option<ProviderId>,
    pub initiated_at: DateTime<Utc>,
    pub status: FailoverStatus,
}
