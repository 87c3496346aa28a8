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
use base64::Engine;
use bigdecimal::BigDecimal;
use conduit_common::model::{TaskState, TaskType, VirtualKeyId, WorkerId};
use conduit_generation_executor::model::event::LifecycleEvent;
use conduit_generation_executor::model::task::ClaimedItem;
use conduit_generation_executor::services::orchestrator::SubmitRequest;
use conduit_generation_executor::services::providers::{MediaPayload, StaticProviderRegistry};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use test_r::test;
use tokio_util::sync::CancellationToken;

use crate::common::{
    drain_topic_counts, environment, wait_for_topic, FlakyTranscriptionProvider,
    ScriptedRealtimeProvider, ScriptedVideoProvider, TestEnvironment, TEST_VIRTUAL_KEY,
};

fn transcription_registry(failures: u32) -> StaticProviderRegistry {
    let mut registry = StaticProviderRegistry::new();
    registry.register(Arc::new(FlakyTranscriptionProvider::new(failures)));
    registry
}

fn submit_request(task_type: TaskType, payload: serde_json::Value) -> SubmitRequest {
    SubmitRequest {
        task_type,
        virtual_key_id: VirtualKeyId::new(TEST_VIRTUAL_KEY),
        payload,
        priority: None,
        webhook_url: None,
        webhook_headers: None,
        correlation_id: None,
        max_retries: None,
    }
}

async fn claim_and_execute(environment: &TestEnvironment, worker: &WorkerId) -> Option<ClaimedItem> {
    let claimed = environment
        .services
        .queue
        .dequeue(worker)
        .await
        .unwrap()?;
    environment
        .services
        .orchestrator
        .execute(claimed.clone(), worker, &CancellationToken::new())
        .await;
    Some(claimed)
}

#[test]
async fn transcription_happy_path() {
    let environment = environment(transcription_registry(0));
    let worker = WorkerId::new("w1");
    let mut subscription = environment.services.event_bus.subscribe_all().await.unwrap();

    let task = environment
        .services
        .orchestrator
        .submit(submit_request(
            TaskType::Transcription,
            serde_json::json!({
                "model": "whisper-1",
                "audio_url": "https://audio.example/sample.wav",
                "provider": "openai",
            }),
        ))
        .await
        .unwrap();
    check!(task.state == TaskState::Pending);

    claim_and_execute(&environment, &worker).await.unwrap();

    let finished = environment
        .services
        .task_service
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    check!(finished.state == TaskState::Completed);
    check!(finished.progress == 100);
    let result = finished.result.unwrap();
    check!(result["text"] == "hello world");
    check!(result["detected_language"] == "en");

    let charge = wait_for_topic(&mut subscription, "ChargeSubmitted").await;
    match charge.map(|envelope| envelope.event) {
        Some(LifecycleEvent::ChargeSubmitted {
            task_id,
            virtual_key_id,
            cost,
        }) => {
            check!(task_id == task.id);
            check!(virtual_key_id == VirtualKeyId::new(TEST_VIRTUAL_KEY));
            check!(cost.total_cost == BigDecimal::from_str("0.006").unwrap());
            check!(cost.is_estimate == false);
        }
        other => panic!("unexpected charge event: {other:?}"),
    }
    let completed = wait_for_topic(&mut subscription, "TaskCompleted").await;
    check!(completed.is_some());

    // The claim is released.
    check!(environment.services.queue.dequeue(&worker).await.unwrap().is_none());
}

#[test]
async fn transient_failure_retries_then_succeeds() {
    let environment = environment(transcription_registry(1));
    let worker = WorkerId::new("w1");
    let mut subscription = environment.services.event_bus.subscribe_all().await.unwrap();

    let task = environment
        .services
        .orchestrator
        .submit(submit_request(
            TaskType::Transcription,
            serde_json::json!({
                "model": "whisper-1",
                "audio_url": "https://audio.example/sample.wav",
                "provider": "openai",
            }),
        ))
        .await
        .unwrap();

    claim_and_execute(&environment, &worker).await.unwrap();

    let after_first = environment
        .services
        .task_service
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    check!(after_first.state == TaskState::Pending);
    check!(after_first.retry_count == 1);
    check!(after_first.next_retry_at.is_some());

    let failed = wait_for_topic(&mut subscription, "TaskFailed").await;
    match failed.map(|envelope| envelope.event) {
        Some(LifecycleEvent::TaskFailed { will_retry, .. }) => { check!(will_retry == true); }
        other => panic!("unexpected failure event: {other:?}"),
    }

    // The retry becomes eligible after the backoff.
    tokio::time::sleep(Duration::from_millis(50)).await;
    claim_and_execute(&environment, &worker).await.unwrap();

    let finished = environment
        .services
        .task_service
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    check!(finished.state == TaskState::Completed);
    check!(finished.retry_count == 1);
    check!(finished.next_retry_at == None);
}

#[test]
async fn retries_exhaust_into_failure() {
    let environment = environment(transcription_registry(10));
    let worker = WorkerId::new("w1");

    let mut request = submit_request(
        TaskType::Transcription,
        serde_json::json!({
            "model": "whisper-1",
            "audio_url": "https://audio.example/sample.wav",
            "provider": "openai",
        }),
    );
    request.max_retries = Some(2);
    let task = environment.services.orchestrator.submit(request).await.unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = claim_and_execute(&environment, &worker).await;
    }

    let finished = environment
        .services
        .task_service
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    check!(finished.state == TaskState::Failed);
    check!(finished.retry_count == 2);
    check!(finished.result == None);
    let error = finished.error.unwrap();
    check!(error.contains("503"));
}

#[test]
async fn video_media_is_persisted_to_our_storage() {
    let video_bytes = b"not-really-an-mp4".to_vec();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&video_bytes);
    let mut registry = StaticProviderRegistry::new();
    registry.register(Arc::new(ScriptedVideoProvider::new(
        "alpha",
        MediaPayload::Inline {
            base64: encoded,
            content_type: "video/mp4".to_string(),
        },
    )));
    let environment = environment(registry);
    let worker = WorkerId::new("w1");
    let mut subscription = environment.services.event_bus.subscribe_all().await.unwrap();

    let task = environment
        .services
        .orchestrator
        .submit(submit_request(
            TaskType::Video,
            serde_json::json!({"model": "sora-2", "prompt": "a cat"}),
        ))
        .await
        .unwrap();

    claim_and_execute(&environment, &worker).await.unwrap();

    let finished = environment
        .services
        .task_service
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    check!(finished.state == TaskState::Completed);
    let result = finished.result.unwrap();
    let expected_key = format!("tasks/{}/output-0.mp4", task.id);
    check!(result["video_url"] == format!("memory://media/{expected_key}"));
    check!(result["prompt"] == "a cat");
    check!(result["generation_duration_seconds"] == 42.5);
    check!(environment.media_store.get(&expected_key).as_deref() == Some(video_bytes.as_slice()));

    let media_event = wait_for_topic(&mut subscription, "MediaGenerationCompleted").await;
    match media_event.map(|envelope| envelope.event) {
        Some(LifecycleEvent::MediaGenerationCompleted {
            storage_key,
            size_bytes,
            ..
        }) => {
            check!(storage_key == expected_key);
            check!(size_bytes == video_bytes.len() as u64);
        }
        other => panic!("unexpected media event: {other:?}"),
    }
}

#[test]
async fn failed_download_keeps_the_provider_url() {
    let provider_url = "http://127.0.0.1:9/video.mp4";
    let mut registry = StaticProviderRegistry::new();
    registry.register(Arc::new(ScriptedVideoProvider::new(
        "alpha",
        MediaPayload::Url {
            url: provider_url.to_string(),
            content_type: Some("video/mp4".to_string()),
        },
    )));
    let environment = environment(registry);
    let worker = WorkerId::new("w1");

    let task = environment
        .services
        .orchestrator
        .submit(submit_request(
            TaskType::Video,
            serde_json::json!({"model": "sora-2", "prompt": "a cat"}),
        ))
        .await
        .unwrap();

    claim_and_execute(&environment, &worker).await.unwrap();

    let finished = environment
        .services
        .task_service
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    check!(finished.state == TaskState::Completed);
    check!(finished.result.unwrap()["video_url"] == provider_url);
    check!(environment.media_store.is_empty());
}

#[test]
async fn cancelled_task_is_not_executed() {
    let environment = environment(transcription_registry(0));
    let worker = WorkerId::new("w1");

    let task = environment
        .services
        .orchestrator
        .submit(submit_request(
            TaskType::Transcription,
            serde_json::json!({
                "model": "whisper-1",
                "audio_url": "https://audio.example/sample.wav",
                "provider": "openai",
            }),
        ))
        .await
        .unwrap();

    environment.services.orchestrator.cancel(&task.id).await.unwrap();
    // Cancelling again is a no-op.
    environment.services.orchestrator.cancel(&task.id).await.unwrap();

    let _ = claim_and_execute(&environment, &worker).await;

    let finished = environment
        .services
        .task_service
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    check!(finished.state == TaskState::Cancelled);
    check!(finished.result == None);
    check!(finished.completed_at.is_some());
}

#[test]
async fn insufficient_balance_fails_without_retry() {
    let environment = environment(transcription_registry(0));
    let worker = WorkerId::new("w1");
    environment.virtual_keys.set_balance(
        VirtualKeyId::new("vk-broke"),
        BigDecimal::from_str("0.000001").unwrap(),
    );

    let mut request = submit_request(
        TaskType::Transcription,
        serde_json::json!({
            "model": "whisper-1",
            "audio_url": "https://audio.example/sample.wav",
            "provider": "openai",
        }),
    );
    request.virtual_key_id = VirtualKeyId::new("vk-broke");
    let task = environment.services.orchestrator.submit(request).await.unwrap();

    claim_and_execute(&environment, &worker).await.unwrap();

    let finished = environment
        .services
        .task_service
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    check!(finished.state == TaskState::Failed);
    check!(finished.retry_count == 0);
    check!(finished.error.unwrap().contains("Unauthorized"));
}

#[test]
async fn malformed_payload_fails_without_retry() {
    let environment = environment(transcription_registry(0));
    let worker = WorkerId::new("w1");

    let task = environment
        .services
        .orchestrator
        .submit(submit_request(
            TaskType::Transcription,
            serde_json::json!({"audio_url": "https://audio.example/sample.wav"}),
        ))
        .await
        .unwrap();

    claim_and_execute(&environment, &worker).await.unwrap();

    let finished = environment
        .services
        .task_service
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    check!(finished.state == TaskState::Failed);
    check!(finished.retry_count == 0);
}

#[test]
async fn legacy_metadata_wrapper_is_supported() {
    let environment = environment(transcription_registry(0));
    let worker = WorkerId::new("w1");

    let task = environment
        .services
        .orchestrator
        .submit(submit_request(
            TaskType::Transcription,
            serde_json::json!({
                "originalMetadata": {
                    "model": "whisper-1",
                    "audio_url": "https://audio.example/sample.wav",
                    "provider": "openai",
                },
                "schemaVersion": 1,
            }),
        ))
        .await
        .unwrap();

    claim_and_execute(&environment, &worker).await.unwrap();

    let finished = environment
        .services
        .task_service
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    check!(finished.state == TaskState::Completed);
}

#[test]
async fn completion_requests_webhook_delivery() {
    let environment = environment(transcription_registry(0));
    let worker = WorkerId::new("w1");
    let mut subscription = environment.services.event_bus.subscribe_all().await.unwrap();

    let mut request = submit_request(
        TaskType::Transcription,
        serde_json::json!({
            "model": "whisper-1",
            "audio_url": "https://audio.example/sample.wav",
            "provider": "openai",
        }),
    );
    request.webhook_url = Some("https://callbacks.example/hook".to_string());
    let task = environment.services.orchestrator.submit(request).await.unwrap();

    claim_and_execute(&environment, &worker).await.unwrap();

    let requested = wait_for_topic(&mut subscription, "WebhookDeliveryRequested").await;
    match requested.map(|envelope| envelope.event) {
        Some(LifecycleEvent::WebhookDeliveryRequested {
            task_id,
            event_type,
            ..
        }) => {
            check!(task_id == task.id);
            check!(
                event_type
                    == conduit_generation_executor::model::event::WebhookEventType::TaskCompleted
            );
        }
        other => panic!("unexpected webhook request: {other:?}"),
    }
}

#[test]
async fn duplicate_execution_after_claim_expiry_charges_exactly_once() {
    // The claim-expiry race: worker one goes quiet mid-execution, orphan
    // recovery hands the same task to worker two, and both finish. The
    // version-fenced terminal transition must let exactly one of them
    // complete and charge.
    let mut registry = StaticProviderRegistry::new();
    registry.register(Arc::new(FlakyTranscriptionProvider::with_delay(
        0,
        Duration::from_millis(50),
    )));
    let environment = environment(registry);
    let first_worker = WorkerId::new("w1");
    let second_worker = WorkerId::new("w2");
    let mut subscription = environment.services.event_bus.subscribe_all().await.unwrap();

    let task = environment
        .services
        .orchestrator
        .submit(submit_request(
            TaskType::Transcription,
            serde_json::json!({
                "model": "whisper-1",
                "audio_url": "https://audio.example/sample.wav",
                "provider": "openai",
            }),
        ))
        .await
        .unwrap();

    let first_claim = environment
        .services
        .queue
        .dequeue(&first_worker)
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let rescued = environment
        .services
        .queue
        .recover_orphans(Duration::ZERO)
        .await
        .unwrap();
    check!(rescued == 1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second_claim = environment
        .services
        .queue
        .dequeue(&second_worker)
        .await
        .unwrap()
        .unwrap();
    check!(second_claim.item.task_id == task.id);

    let orchestrator = environment.services.orchestrator.clone();
    let token = CancellationToken::new();
    tokio::join!(
        orchestrator.execute(first_claim, &first_worker, &token),
        orchestrator.execute(second_claim, &second_worker, &token),
    );

    let finished = environment
        .services
        .task_service
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    check!(finished.state == TaskState::Completed);
    check!(finished.result.is_some());

    let counts = drain_topic_counts(&mut subscription, Duration::from_millis(200)).await;
    check!(counts.get("ChargeSubmitted").copied().unwrap_or(0) == 1);
    check!(counts.get("TaskCompleted").copied().unwrap_or(0) == 1);
}

#[test]
async fn realtime_sessions_are_charged_per_component() {
    let mut registry = StaticProviderRegistry::new();
    registry.register(Arc::new(ScriptedRealtimeProvider));
    let environment = environment(registry);
    let worker = WorkerId::new("w1");
    let mut subscription = environment.services.event_bus.subscribe_all().await.unwrap();

    let task = environment
        .services
        .orchestrator
        .submit(submit_request(
            TaskType::Realtime,
            serde_json::json!({"model": "gpt-4o-realtime-preview", "provider": "openai"}),
        ))
        .await
        .unwrap();

    claim_and_execute(&environment, &worker).await.unwrap();

    let finished = environment
        .services
        .task_service
        .get(&task.id)
        .await
        .unwrap()
        .unwrap();
    check!(finished.state == TaskState::Completed);
    check!(finished.result.unwrap()["session_id"] == "sess-1");

    let charge = wait_for_topic(&mut subscription, "ChargeSubmitted").await;
    match charge.map(|envelope| envelope.event) {
        Some(LifecycleEvent::ChargeSubmitted { cost, .. }) => {
            // 5 min in + 3 min out + 1000 input and 500 output tokens.
            check!(cost.total_cost == BigDecimal::from_str("1.1125").unwrap());
            check!(cost.breakdown.unwrap().len() == 4);
        }
        other => panic!("unexpected charge event: {other:?}"),
    }
}

#[test]
async fn two_submissions_are_independent_lifecycles() {
    let environment = environment(transcription_registry(0));
    let worker = WorkerId::new("w1");

    let payload = serde_json::json!({
        "model": "whisper-1",
        "audio_url": "https://audio.example/sample.wav",
        "provider": "openai",
    });
    let first = environment
        .services
        .orchestrator
        .submit(submit_request(TaskType::Transcription, payload.clone()))
        .await
        .unwrap();
    let second = environment
        .services
        .orchestrator
        .submit(submit_request(TaskType::Transcription, payload))
        .await
        .unwrap();
    check!(first.id != second.id);

    claim_and_execute(&environment, &worker).await.unwrap();
    claim_and_execute(&environment, &worker).await.unwrap();

    for task in [&first, &second] {
        let finished = environment
            .services
            .task_service
            .get(&task.id)
            .await
            .unwrap()
            .unwrap();
        check!(finished.state == TaskState::Completed);
    }
}
