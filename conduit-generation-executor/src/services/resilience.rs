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

//! Provider health state machine (C7): Healthy -> Throttled -> Quarantined ->
//! Recovering -> Healthy, with terminal PermanentlyFailed. The in-memory map
//! is the working copy; the authoritative mirror lives in the key/value store
//! and routing weights are pushed through the [`ProviderRouter`] seam.

use crate::model::event::{EventEnvelope, LifecycleEvent};
use crate::model::health::{FailoverRecord, FailoverStatus, ProviderHealth, ProviderState};
use crate::services::events::{EventBus, EventBusError};
use crate::services::providers::{ProviderRegistry, ProviderRouter};
use crate::storage::keyvalue::{KeyValueStorage, KeyValueStorageNamespace};
use crate::storage::{serialize_entity, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_common::model::{ProviderId, ProviderOperation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

const SVC_NAME: &str = "resilience";
const NS: KeyValueStorageNamespace = KeyValueStorageNamespace::Resilience;

/// Response-time samples kept per provider for the slow-provider check.
const RESPONSE_WINDOW: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    EventBus(#[from] EventBusError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResilienceConfig {
    /// Consecutive failures that quarantine a provider.
    pub failure_threshold: u32,
    /// Average response time beyond which a provider is throttled.
    pub slow_threshold_ms: f64,
    /// Quarantine must last at least this long before recovery is attempted.
    #[serde(with = "humantime_serde")]
    pub minimum_quarantine: Duration,
    /// Quarantine longer than this without recovery is permanent failure.
    #[serde(with = "humantime_serde")]
    pub maximum_quarantine: Duration,
    /// Health score a recovering provider must exceed to return to Healthy.
    pub recovery_threshold: f64,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub recovery_interval: Duration,
    /// Recovering providers stuck longer than this get their probe state
    /// reset by the self-healing pass.
    #[serde(with = "humantime_serde")]
    pub circuit_reset_after: Duration,
    pub slow_throttle_level: f64,
    pub recovery_initial_throttle: f64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            slow_threshold_ms: 5000.0,
            minimum_quarantine: Duration::from_secs(2 * 60),
            maximum_quarantine: Duration::from_secs(60 * 60),
            recovery_threshold: 0.8,
            health_check_interval: Duration::from_secs(2 * 60),
            recovery_interval: Duration::from_secs(5 * 60),
            circuit_reset_after: Duration::from_secs(60 * 60),
            slow_throttle_level: 0.5,
            recovery_initial_throttle: 0.1,
        }
    }
}

#[async_trait]
pub trait ResilienceService: Send + Sync {
    async fn record_success(&self, provider: &ProviderId, duration: Duration);

    async fn record_failure(&self, provider: &ProviderId, reason: &str);

    async fn health(&self, provider: &ProviderId) -> Option<ProviderHealth>;

    async fn accepts_traffic(&self, provider: &ProviderId) -> bool;

    /// The provider currently standing in for a quarantined one, if any.
    async fn active_failover(&self, provider: &ProviderId) -> Option<ProviderId>;

    /// Healthy alternate with the same capability and model category,
    /// highest health score first.
    async fn select_failover(
        &self,
        failed: &ProviderId,
        operation: ProviderOperation,
        model_category: &str,
    ) -> Option<ProviderId>;

    /// Periodic evaluation of the metrics snapshot: throttling of slow
    /// providers, weight rebalance, state mirroring.
    async fn run_health_check(&self) -> Result<(), ResilienceError>;

    /// Periodic recovery pass: probes quarantined providers, advances
    /// Recovering ones, applies permanent failure, performs self-healing.
    async fn run_recovery(&self) -> Result<(), ResilienceError>;

    async fn snapshot(&self) -> Vec<ProviderHealth>;
}

struct Entry {
    health: ProviderHealth,
    response_times_ms: VecDeque<f64>,
}

impl Entry {
    fn new(provider: ProviderId) -> Self {
        Self {
            health: ProviderHealth::new(provider),
            response_times_ms: VecDeque::with_capacity(RESPONSE_WINDOW),
        }
    }

    fn average_response_ms(&self) -> Option<f64> {
        if self.response_times_ms.is_empty() {
            return None;
        }
        Some(self.response_times_ms.iter().sum::<f64>() / self.response_times_ms.len() as f64)
    }
}

struct State {
    entries: HashMap<ProviderId, Entry>,
    failovers: HashMap<ProviderId, FailoverRecord>,
}

pub struct ResilienceServiceDefault {
    state: Mutex<State>,
    registry: Arc<dyn ProviderRegistry>,
    router: Arc<dyn ProviderRouter>,
    event_bus: Arc<dyn EventBus>,
    key_value_storage: Arc<dyn KeyValueStorage>,
    config: ResilienceConfig,
}

impl ResilienceServiceDefault {
    pub fn new(
        registry: Arc<dyn ProviderRegistry>,
        router: Arc<dyn ProviderRouter>,
        event_bus: Arc<dyn EventBus>,
        key_value_storage: Arc<dyn KeyValueStorage>,
        config: ResilienceConfig,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                failovers: HashMap::new(),
            }),
            registry,
            router,
            event_bus,
            key_value_storage,
            config,
        }
    }

    async fn publish(&self, event: LifecycleEvent) {
        if let Err(err) = self.event_bus.publish(EventEnvelope::new(event)).await {
            warn!("failed to publish resilience event: {err}");
        }
    }

    async fn mirror(&self, health: &ProviderHealth) {
        let result: Result<(), StorageError> = async {
            let bytes = serialize_entity(SVC_NAME, "provider-health", health)?;
            self.key_value_storage
                .set(
                    SVC_NAME,
                    "mirror",
                    "provider-health",
                    NS,
                    &format!("providers:{}", health.provider),
                    &bytes,
                    None,
                )
                .await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            warn!(provider = %health.provider, "failed to mirror provider health: {err}");
        }
    }

    fn routing_weight(health: &ProviderHealth) -> f64 {
        match health.state {
            ProviderState::Quarantined | ProviderState::PermanentlyFailed => 0.0,
            _ => (health.health_score * health.throttle_level).clamp(0.0, 1.0),
        }
    }

    async fn push_weight(&self, health: &ProviderHealth) {
        self.router
            .set_weight(&health.provider, Self::routing_weight(health))
            .await;
    }

    fn quarantine(health: &mut ProviderHealth, reason: &str, now: DateTime<Utc>) {
        health.state = ProviderState::Quarantined;
        health.quarantined_at = Some(now);
        health.quarantine_reason = Some(reason.to_string());
        health.throttle_level = 0.0;
        health.recovery_started = None;
        health.last_transition = now;
    }

    /// Quarantines and initiates failover; must be called with the state lock
    /// held, takes everything it mutates explicitly.
    async fn quarantine_and_failover(
        &self,
        state: &mut State,
        provider: &ProviderId,
        reason: &str,
    ) {
        let now = Utc::now();
        let health = match state.entries.get_mut(provider) {
            Some(entry) => {
                Self::quarantine(&mut entry.health, reason, now);
                entry.health.clone()
            }
            None => return,
        };
        crate::metrics::record_provider_quarantined();
        info!(provider = %provider, reason, "provider quarantined");

        self.push_weight(&health).await;
        self.mirror(&health).await;
        self.publish(LifecycleEvent::ProviderQuarantined {
            provider: provider.clone(),
            reason: reason.to_string(),
        })
        .await;

        // Failover selection considers providers sharing any capability and
        // category of the failed one.
        let failover = self
            .find_alternate(state, provider)
            .map(|candidate| candidate.provider.clone());
        state.failovers.insert(
            provider.clone(),
            FailoverRecord {
                failed_provider: provider.clone(),
                failover_provider: failover.clone(),
                initiated_at: now,
                status: if failover.is_some() {
                    FailoverStatus::Active
                } else {
                    FailoverStatus::NoAlternative
                },
            },
        );
        self.publish(LifecycleEvent::ProviderFailoverInitiated {
            failed_provider: provider.clone(),
            failover_provider: failover,
        })
        .await;
    }

    /// Highest-health healthy provider sharing capability and model category
    /// with the failed one.
    fn find_alternate<'a>(&self, state: &'a State, failed: &ProviderId) -> Option<&'a ProviderHealth> {
        let failed_descriptor = self.registry.get(failed)?.descriptor();
        let mut best: Option<&ProviderHealth> = None;
        for client in self.registry.all() {
            let descriptor = client.descriptor();
            if descriptor.id == *failed {
                continue;
            }
            let shares_capability = descriptor
                .capabilities
                .intersection(&failed_descriptor.capabilities)
                .next()
                .is_some();
            let shares_category = descriptor
                .model_categories
                .intersection(&failed_descriptor.model_categories)
                .next()
                .is_some();
            if !shares_capability || !shares_category {
                continue;
            }
            let Some(entry) = state.entries.get(&descriptor.id) else {
                continue;
            };
            if !entry.health.is_healthy() {
                continue;
            }
            match best {
                Some(current) if current.health_score >= entry.health.health_score => {}
                _ => best = Some(&entry.health),
            }
        }
        best
    }

    async fn revert_failover(&self, state: &mut State, provider: &ProviderId) {
        if let Some(record) = state.failovers.get_mut(provider) {
            if matches!(
                record.status,
                FailoverStatus::Active | FailoverStatus::Initiated | FailoverStatus::Recovering
            ) {
                record.status = FailoverStatus::Completed;
                self.publish(LifecycleEvent::ProviderFailoverReverted {
                    original_provider: provider.clone(),
                })
                .await;
            }
        }
    }
}

#[async_trait]
impl ResilienceService for ResilienceServiceDefault {
    async fn record_success(&self, provider: &ProviderId, duration: Duration) {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .entry(provider.clone())
            .or_insert_with(|| Entry::new(provider.clone()));
        entry.health.consecutive_failures = 0;
        entry.health.health_score = (entry.health.health_score * 0.9 + 0.1).min(1.0);
        if entry.response_times_ms.len() == RESPONSE_WINDOW {
            entry.response_times_ms.pop_front();
        }
        entry.response_times_ms.push_back(duration.as_millis() as f64);
    }

    async fn record_failure(&self, provider: &ProviderId, reason: &str) {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .entry(provider.clone())
            .or_insert_with(|| Entry::new(provider.clone()));
        entry.health.consecutive_failures += 1;
        entry.health.health_score = (entry.health.health_score * 0.7).max(0.0);

        let should_quarantine = entry.health.consecutive_failures >= self.config.failure_threshold
            && entry.health.is_healthy();
        if should_quarantine {
            let reason = format!(
                "{} consecutive failures, last: {reason}",
                entry.health.consecutive_failures
            );
            self.quarantine_and_failover(&mut state, provider, &reason)
                .await;
        }
    }

    async fn health(&self, provider: &ProviderId) -> Option<ProviderHealth> {
        let state = self.state.lock().await;
        state
            .entries
            .get(provider)
            .map(|entry| entry.health.clone())
    }

    async fn accepts_traffic(&self, provider: &ProviderId) -> bool {
        let state = self.state.lock().await;
        state
            .entries
            .get(provider)
            .map(|entry| entry.health.accepts_traffic())
            // Unknown providers have no recorded failures yet.
            .unwrap_or(true)
    }

    async fn active_failover(&self, provider: &ProviderId) -> Option<ProviderId> {
        let state = self.state.lock().await;
        state.failovers.get(provider).and_then(|record| {
            if matches!(
                record.status,
                FailoverStatus::Initiated | FailoverStatus::Active
            ) {
                record.failover_provider.clone()
            } else {
                None
            }
        })
    }

    async fn select_failover(
        &self,
        failed: &ProviderId,
        operation: ProviderOperation,
        model_category: &str,
    ) -> Option<ProviderId> {
        let state = self.state.lock().await;
        let mut best: Option<(ProviderId, f64)> = None;
        for client in self.registry.all() {
            let descriptor = client.descriptor();
            if descriptor.id == *failed
                || !descriptor.capabilities.contains(&operation)
                || !descriptor.model_categories.contains(model_category)
            {
                continue;
            }
            let score = state
                .entries
                .get(&descriptor.id)
                .filter(|entry| entry.health.is_healthy())
                .map(|entry| entry.health.health_score)
                .unwrap_or(1.0);
            let unhealthy = state
                .entries
                .get(&descriptor.id)
                .map(|entry| !entry.health.is_healthy())
                .unwrap_or(false);
            if unhealthy {
                continue;
            }
            match &best {
                Some((_, best_score)) if *best_score >= score => {}
                _ => best = Some((descriptor.id, score)),
            }
        }
        best.map(|(id, _)| id)
    }

    async fn run_health_check(&self) -> Result<(), ResilienceError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let mut mirrored = Vec::new();
        for entry in state.entries.values_mut() {
            match entry.health.state {
                ProviderState::Healthy => {
                    if let Some(average) = entry.average_response_ms() {
                        if average > self.config.slow_threshold_ms {
                            entry.health.state = ProviderState::Throttled;
                            entry.health.throttle_level = self.config.slow_throttle_level;
                            entry.health.last_transition = now;
                            info!(
                                provider = %entry.health.provider,
                                average_ms = average,
                                "provider throttled for slow responses"
                            );
                        }
                    }
                }
                ProviderState::Throttled => {
                    let recovered = entry
                        .average_response_ms()
                        .map(|average| average <= self.config.slow_threshold_ms)
                        .unwrap_or(true);
                    if recovered {
                        entry.health.state = ProviderState::Healthy;
                        entry.health.throttle_level = 1.0;
                        entry.health.last_transition = now;
                    }
                }
                _ => {}
            }
            mirrored.push(entry.health.clone());
        }
        drop(state);

        for health in mirrored {
            self.push_weight(&health).await;
            self.mirror(&health).await;
        }
        Ok(())
    }

    async fn run_recovery(&self) -> Result<(), ResilienceError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let providers: Vec<ProviderId> = state.entries.keys().cloned().collect();
        for provider in providers {
            let (provider_state, quarantined_at, recovery_started) = {
                let entry = match state.entries.get(&provider) {
                    Some(entry) => entry,
                    None => continue,
                };
                (
                    entry.health.state,
                    entry.health.quarantined_at,
                    entry.health.recovery_started,
                )
            };

            match provider_state {
                ProviderState::Quarantined => {
                    let quarantined_for = quarantined_at
                        .map(|at| now.signed_duration_since(at))
                        .unwrap_or_else(chrono::Duration::zero);

                    if quarantined_for
                        > chrono::Duration::from_std(self.config.maximum_quarantine)
                            .unwrap_or_else(|_| chrono::Duration::hours(1))
                    {
                        if let Some(entry) = state.entries.get_mut(&provider) {
                            entry.health.state = ProviderState::PermanentlyFailed;
                            entry.health.last_transition = now;
                            let health = entry.health.clone();
                            warn!(provider = %provider, "provider permanently failed");
                            self.push_weight(&health).await;
                            self.mirror(&health).await;
                        }
                        continue;
                    }

                    if quarantined_for
                        < chrono::Duration::from_std(self.config.minimum_quarantine)
                            .unwrap_or_else(|_| chrono::Duration::zero())
                    {
                        continue;
                    }

                    let probe = match self.registry.get(&provider) {
                        Some(client) => client.health_check().await,
                        None => continue,
                    };
                    if probe.is_ok() {
                        if let Some(entry) = state.entries.get_mut(&provider) {
                            entry.health.state = ProviderState::Recovering;
                            entry.health.recovery_started = Some(now);
                            entry.health.throttle_level = self.config.recovery_initial_throttle;
                            entry.health.consecutive_failures = 0;
                            entry.health.last_transition = now;
                            let health = entry.health.clone();
                            info!(provider = %provider, "provider entering recovery");
                            self.push_weight(&health).await;
                            self.mirror(&health).await;
                        }
                        if let Some(record) = state.failovers.get_mut(&provider) {
                            record.status = FailoverStatus::Recovering;
                        }
                        self.publish(LifecycleEvent::ProviderRecoveryInitiated {
                            provider: provider.clone(),
                        })
                        .await;
                    }
                }
                ProviderState::Recovering => {
                    // Self-healing: probe state stuck too long is reset.
                    if let Some(started) = recovery_started {
                        if now.signed_duration_since(started)
                            > chrono::Duration::from_std(self.config.circuit_reset_after)
                                .unwrap_or_else(|_| chrono::Duration::hours(1))
                        {
                            if let Some(entry) = state.entries.get_mut(&provider) {
                                entry.health.recovery_started = Some(now);
                                entry.health.throttle_level =
                                    self.config.recovery_initial_throttle;
                                warn!(provider = %provider, "reset stuck recovery");
                            }
                        }
                    }

                    let probe = match self.registry.get(&provider) {
                        Some(client) => client.health_check().await,
                        None => continue,
                    };
                    let mut recovered = false;
                    if let Some(entry) = state.entries.get_mut(&provider) {
                        if probe.is_ok() {
                            entry.health.health_score =
                                (entry.health.health_score * 0.8 + 0.2).min(1.0);
                            entry.health.throttle_level =
                                (entry.health.throttle_level + 0.2).min(1.0);
                            if entry.health.health_score > self.config.recovery_threshold {
                                entry.health.state = ProviderState::Healthy;
                                entry.health.throttle_level = 1.0;
                                entry.health.quarantined_at = None;
                                entry.health.quarantine_reason = None;
                                entry.health.recovery_started = None;
                                entry.health.last_transition = now;
                                info!(provider = %provider, "provider recovered");
                                recovered = true;
                            }
                        } else {
                            Self::quarantine(&mut entry.health, "recovery probe failed", now);
                        }
                        let health = entry.health.clone();
                        self.push_weight(&health).await;
                        self.mirror(&health).await;
                    }
                    if recovered {
                        self.revert_failover(&mut state, &provider).await;
                    }
                }
                _ => {}
            }
        }

        // Rebalance: healthy providers weighted by health score, and drop
        // mirror entries for providers no longer registered.
        let healthy: Vec<ProviderHealth> = state
            .entries
            .values()
            .filter(|entry| entry.health.is_healthy())
            .map(|entry| entry.health.clone())
            .collect();
        let registered: Vec<ProviderId> = self
            .registry
            .all()
            .into_iter()
            .map(|client| client.descriptor().id)
            .collect();
        let stale: Vec<ProviderId> = state
            .entries
            .keys()
            .filter(|provider| !registered.contains(provider))
            .cloned()
            .collect();
        for provider in &stale {
            state.entries.remove(provider);
        }
        drop(state);

        for health in healthy {
            self.push_weight(&health).await;
        }
        for provider in stale {
            self.key_value_storage
                .del(SVC_NAME, "recovery", NS, &format!("providers:{provider}"))
                .await?;
        }
        Ok(())
    }

    async fn snapshot(&self) -> Vec<ProviderHealth> {
        let state = self.state.lock().await;
        let mut all: Vec<ProviderHealth> = state
            .entries
            .values()
            .map(|entry| entry.health.clone())
            .collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }
}
