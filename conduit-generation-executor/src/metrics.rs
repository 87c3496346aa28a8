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

use conduit_common::model::{Priority, TaskState};
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

lazy_static! {
    static ref TASK_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "conduit_task_transitions_total",
        "Task state transitions",
        &["state"]
    )
    .unwrap();
    static ref WORK_ITEMS_ENQUEUED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "conduit_work_items_enqueued_total",
        "Work items enqueued by priority class",
        &["priority"]
    )
    .unwrap();
    static ref CLAIMS_ACQUIRED_TOTAL: IntCounter = register_int_counter!(
        "conduit_claims_acquired_total",
        "Successfully acquired work claims"
    )
    .unwrap();
    static ref ORPHANS_RECOVERED_TOTAL: IntCounter = register_int_counter!(
        "conduit_orphans_recovered_total",
        "Tasks rescued from expired claims"
    )
    .unwrap();
    static ref WEBHOOK_DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "conduit_webhook_deliveries_total",
        "Webhook delivery attempts by outcome",
        &["outcome"]
    )
    .unwrap();
    static ref PROVIDERS_QUARANTINED_TOTAL: IntCounter = register_int_counter!(
        "conduit_providers_quarantined_total",
        "Provider quarantine transitions"
    )
    .unwrap();
    static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "conduit_queue_depth",
        "Work items waiting in the streams and retry set"
    )
    .unwrap();
}

pub fn record_task_transition(state: TaskState) {
    TASK_TRANSITIONS_TOTAL
        .with_label_values(&[&state.to_string()])
        .inc();
}

pub fn record_enqueued(priority: Priority) {
    WORK_ITEMS_ENQUEUED_TOTAL
        .with_label_values(&[&priority.to_string()])
        .inc();
}

pub fn record_claim_acquired() {
    CLAIMS_ACQUIRED_TOTAL.inc();
}

pub fn record_orphan_recovered() {
    ORPHANS_RECOVERED_TOTAL.inc();
}

pub fn record_webhook_delivery(outcome: &'static str) {
    WEBHOOK_DELIVERIES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_provider_quarantined() {
    PROVIDERS_QUARANTINED_TOTAL.inc();
}

pub fn record_queue_depth(depth: u64) {
    QUEUE_DEPTH.set(depth as i64);
}
