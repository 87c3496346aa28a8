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
use chrono::Utc;
use conduit_common::model::{CorrelationId, TaskId, TaskState, TaskType, VirtualKeyId};
use conduit_generation_executor::model::event::WebhookEventType;
use conduit_generation_executor::model::task::Task;
use conduit_generation_executor::services::webhook::{
    dedup_key, render_body, WebhookDeliveryConfig, WebhookService, WebhookServiceDefault,
};
use test_r::test;

fn video_task(state: TaskState) -> Task {
    Task {
        id: TaskId::generate(),
        version: 1,
        task_type: TaskType::Video,
        virtual_key_id: VirtualKeyId::new("vk-1"),
        payload: serde_json::json!({"model": "sora-2", "prompt": "a cat"}),
        state,
        progress: 50,
        progress_message: Some("halfway".to_string()),
        result: Some(serde_json::json!({
            "video_url": "https://media.example/tasks/x/output-0.mp4",
            "model": "sora-2",
            "prompt": "a cat",
            "generation_duration_seconds": 42.5,
            "internal_trace": "not-for-receivers",
        })),
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
fn completed_body_surfaces_result_fields() {
    let task = video_task(TaskState::Completed);
    let body = render_body(&task, WebhookEventType::TaskCompleted, &serde_json::json!({}));

    check!(body["task_id"] == serde_json::json!(task.id));
    check!(body["status"] == "completed");
    check!(body["video_url"] == "https://media.example/tasks/x/output-0.mp4");
    check!(body["model"] == "sora-2");
    check!(body["prompt"] == "a cat");
    check!(body["generation_duration_seconds"] == 42.5);
    // Only whitelisted result fields pass through.
    check!(body.get("internal_trace").is_none());
}

#[test]
fn failed_body_distinguishes_retrying() {
    let mut task = video_task(TaskState::Failed);
    task.error = Some("upstream exploded".to_string());

    let terminal = render_body(
        &task,
        WebhookEventType::TaskFailed,
        &serde_json::json!({"will_retry": false}),
    );
    check!(terminal["status"] == "failed");
    check!(terminal["error"] == "upstream exploded");

    let retrying = render_body(
        &task,
        WebhookEventType::TaskFailed,
        &serde_json::json!({"will_retry": true}),
    );
    check!(retrying["status"] == "retrying");
}

#[test]
fn progress_body_carries_percentage_and_estimate() {
    let task = video_task(TaskState::Processing);
    let body = render_body(
        &task,
        WebhookEventType::TaskProgress,
        &serde_json::json!({"estimated_seconds_remaining": 90}),
    );

    check!(body["status"] == "processing");
    check!(body["progress_percentage"] == 50);
    check!(body["message"] == "halfway");
    check!(body["estimated_seconds_remaining"] == 90);
}

#[test]
fn cancelled_body_is_minimal() {
    let task = video_task(TaskState::Cancelled);
    let body = render_body(&task, WebhookEventType::TaskCancelled, &serde_json::json!({}));

    check!(body["status"] == "cancelled");
    check!(body.get("error").is_none());
}

#[test]
fn dedup_keys_are_stable_within_a_slot() {
    let task = video_task(TaskState::Completed);

    let first = dedup_key(&task, WebhookEventType::TaskCompleted);
    let second = dedup_key(&task, WebhookEventType::TaskCompleted);
    let other_event = dedup_key(&task, WebhookEventType::TaskFailed);

    check!(first == second);
    check!(first != other_event);
    check!(first.starts_with(&format!("video-{}-TaskCompleted-", task.id)));
}

#[test]
async fn delivery_without_webhook_url_is_a_no_op() {
    let service = WebhookServiceDefault::new(WebhookDeliveryConfig::default()).unwrap();
    let task = video_task(TaskState::Completed);

    let result = service
        .deliver(&task, WebhookEventType::TaskCompleted, &serde_json::json!({}))
        .await;

    check!(result.is_ok());
}
