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

use assert2::check;
use conduit_common::model::{ProviderId, ProviderOperation};
use conduit_generation_executor::model::event::LifecycleEvent;
use conduit_generation_executor::model::health::ProviderState;
use conduit_generation_executor::services::providers::{
    MediaPayload, ProviderRouter, StaticProviderRegistry,
};
use conduit_generation_executor::services::resilience::ResilienceService;
use std::sync::Arc;
use std::time::Duration;
use test_r::test;

use crate::common::{environment, environment_with_config, fast_config, wait_for_topic, ScriptedVideoProvider};

fn video_payload() -> MediaPayload {
    MediaPayload::Url {
        url: "https://provider.example/video.mp4".to_string(),
        content_type: Some("video/mp4".to_string()),
    }
}

fn two_provider_registry() -> StaticProviderRegistry {
    let mut registry = StaticProviderRegistry::new();
    registry.register(Arc::new(ScriptedVideoProvider::new("alpha", video_payload())));
    registry.register(Arc::new(ScriptedVideoProvider::new("beta", video_payload())));
    registry
}

#[test]
async fn consecutive_failures_quarantine_and_fail_over() {
    let environment = environment(two_provider_registry());
    let resilience = environment.services.resilience.clone();
    let router = environment.services.router.clone();
    let alpha = ProviderId::new("alpha");

    let mut subscription = environment.services.event_bus.subscribe_all().await.unwrap();

    // Both providers known to the controller.
    resilience.record_success(&alpha, Duration::from_millis(100)).await;
    resilience
        .record_success(&ProviderId::new("beta"), Duration::from_millis(100))
        .await;

    for _ in 0..3 {
        resilience.record_failure(&alpha, "upstream 500").await;
    }

    let health = resilience.health(&alpha).await.unwrap();
    check!(health.state == ProviderState::Quarantined);
    check!(health.quarantined_at.is_some());
    check!(health.consecutive_failures == 3);
    check!(!health.accepts_traffic());

    let quarantined = wait_for_topic(&mut subscription, "ProviderQuarantined").await;
    check!(quarantined.is_some());
    let failover = wait_for_topic(&mut subscription, "ProviderFailoverInitiated").await;
    match failover.map(|envelope| envelope.event) {
        Some(LifecycleEvent::ProviderFailoverInitiated {
            failed_provider,
            failover_provider,
        }) => {
            check!(failed_provider == alpha);
            check!(failover_provider == Some(ProviderId::new("beta")));
        }
        other => panic!("unexpected failover event: {other:?}"),
    }

    // Routing now avoids the quarantined provider.
    check!(router.weight(&alpha).await == 0.0);
    let routed = router
        .route(ProviderOperation::VideoGeneration, "sora")
        .await;
    check!(routed == Some(ProviderId::new("beta")));
    check!(
        resilience.active_failover(&alpha).await == Some(ProviderId::new("beta"))
    );
}

#[test]
async fn recovery_returns_provider_to_rotation() {
    let mut config = fast_config();
    config.resilience.minimum_quarantine = Duration::ZERO;
    let environment = environment_with_config(two_provider_registry(), config);
    let resilience = environment.services.resilience.clone();
    let alpha = ProviderId::new("alpha");

    let mut subscription = environment.services.event_bus.subscribe_all().await.unwrap();

    resilience
        .record_success(&ProviderId::new("beta"), Duration::from_millis(100))
        .await;
    for _ in 0..3 {
        resilience.record_failure(&alpha, "upstream 500").await;
    }
    check!(resilience.health(&alpha).await.unwrap().state == ProviderState::Quarantined);

    // First pass enters recovery via a successful probe; subsequent passes
    // raise the score until the provider is healthy again.
    for _ in 0..12 {
        resilience.run_recovery().await.unwrap();
        if resilience.health(&alpha).await.unwrap().state == ProviderState::Healthy {
            break;
        }
    }

    let health = resilience.health(&alpha).await.unwrap();
    check!(health.state == ProviderState::Healthy);
    check!(health.throttle_level == 1.0);
    check!(health.quarantined_at == None);

    let recovery = wait_for_topic(&mut subscription, "ProviderRecoveryInitiated").await;
    check!(recovery.is_some());
    let reverted = wait_for_topic(&mut subscription, "ProviderFailoverReverted").await;
    match reverted.map(|envelope| envelope.event) {
        Some(LifecycleEvent::ProviderFailoverReverted { original_provider }) => {
            check!(original_provider == alpha);
        }
        other => panic!("unexpected revert event: {other:?}"),
    }
    check!(resilience.active_failover(&alpha).await == None);
}

#[test]
async fn quarantine_past_maximum_is_permanent_exactly_once() {
    let mut config = fast_config();
    config.resilience.maximum_quarantine = Duration::ZERO;
    let environment = environment_with_config(two_provider_registry(), config);
    let resilience = environment.services.resilience.clone();
    let alpha = ProviderId::new("alpha");

    for _ in 0..3 {
        resilience.record_failure(&alpha, "upstream 500").await;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;

    resilience.run_recovery().await.unwrap();
    let health = resilience.health(&alpha).await.unwrap();
    check!(health.state == ProviderState::PermanentlyFailed);
    let first_transition = health.last_transition;

    // A second pass leaves the terminal state untouched.
    resilience.run_recovery().await.unwrap();
    let health = resilience.health(&alpha).await.unwrap();
    check!(health.state == ProviderState::PermanentlyFailed);
    check!(health.last_transition == first_transition);
}

#[test]
async fn slow_providers_are_throttled_and_recover() {
    let mut config = fast_config();
    config.resilience.slow_threshold_ms = 50.0;
    let environment = environment_with_config(two_provider_registry(), config);
    let resilience = environment.services.resilience.clone();
    let router = environment.services.router.clone();
    let alpha = ProviderId::new("alpha");

    for _ in 0..5 {
        resilience.record_success(&alpha, Duration::from_millis(200)).await;
    }
    resilience.run_health_check().await.unwrap();

    let health = resilience.health(&alpha).await.unwrap();
    check!(health.state == ProviderState::Throttled);
    check!(health.throttle_level == 0.5);
    check!(router.weight(&alpha).await <= 0.5);

    // Response times back under the threshold lift the throttle.
    for _ in 0..50 {
        resilience.record_success(&alpha, Duration::from_millis(1)).await;
    }
    resilience.run_health_check().await.unwrap();
    let health = resilience.health(&alpha).await.unwrap();
    check!(health.state == ProviderState::Healthy);
    check!(health.throttle_level == 1.0);
}

#[test]
async fn failover_selection_prefers_highest_health_score() {
    let environment = environment(two_provider_registry());
    let resilience = environment.services.resilience.clone();
    let beta = ProviderId::new("beta");

    resilience.record_success(&beta, Duration::from_millis(10)).await;

    let selected = resilience
        .select_failover(
            &ProviderId::new("alpha"),
            ProviderOperation::VideoGeneration,
            "sora",
        )
        .await;
    check!(selected == Some(beta));

    let none = resilience
        .select_failover(
            &ProviderId::new("alpha"),
            ProviderOperation::Transcription,
            "whisper",
        )
        .await;
    check!(none == None);
}
