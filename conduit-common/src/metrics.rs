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

pub const DEFAULT_TIME_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

pub const DEFAULT_SIZE_BUCKETS: &[f64] = &[
    1024.0,
    4096.0,
    16384.0,
    65536.0,
    262144.0,
    1048576.0,
    4194304.0,
    16777216.0,
];

pub mod redis {
    use lazy_static::lazy_static;
    use prometheus::{
        register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
    };
    use std::time::Duration;

    lazy_static! {
        static ref REDIS_SUCCESS_SECONDS: HistogramVec = register_histogram_vec!(
            "conduit_redis_success_seconds",
            "Duration of successful Redis calls",
            &["svc", "api", "cmd"],
            super::DEFAULT_TIME_BUCKETS.to_vec()
        )
        .unwrap();
        static ref REDIS_FAILURE_TOTAL: IntCounterVec = register_int_counter_vec!(
            "conduit_redis_failure_total",
            "Number of failed Redis calls",
            &["svc", "api", "cmd"]
        )
        .unwrap();
        static ref REDIS_SERIALIZED_SIZE_BYTES: HistogramVec = register_histogram_vec!(
            "conduit_redis_serialized_size_bytes",
            "Size of serialized entities written to Redis",
            &["svc", "entity"],
            super::DEFAULT_SIZE_BUCKETS.to_vec()
        )
        .unwrap();
    }

    pub fn record_redis_success(
        svc_name: &'static str,
        api_name: &'static str,
        cmd_name: &'static str,
        duration: Duration,
    ) {
        REDIS_SUCCESS_SECONDS
            .with_label_values(&[svc_name, api_name, cmd_name])
            .observe(duration.as_secs_f64());
    }

    pub fn record_redis_failure(
        svc_name: &'static str,
        api_name: &'static str,
        cmd_name: &'static str,
    ) {
        REDIS_FAILURE_TOTAL
            .with_label_values(&[svc_name, api_name, cmd_name])
            .inc();
    }

    pub fn record_redis_serialized_size(
        svc_name: &'static str,
        entity_name: &'static str,
        size: usize,
    ) {
        REDIS_SERIALIZED_SIZE_BYTES
            .with_label_values(&[svc_name, entity_name])
            .observe(size as f64);
    }
}

pub mod external {
    use lazy_static::lazy_static;
    use prometheus::{
        register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
    };
    use std::time::Duration;

    lazy_static! {
        static ref EXTERNAL_SUCCESS_SECONDS: HistogramVec = register_histogram_vec!(
            "conduit_external_call_success_seconds",
            "Duration of successful calls to external collaborators",
            &["target", "op"],
            super::DEFAULT_TIME_BUCKETS.to_vec()
        )
        .unwrap();
        static ref EXTERNAL_FAILURE_TOTAL: IntCounterVec = register_int_counter_vec!(
            "conduit_external_call_failure_total",
            "Number of failed calls to external collaborators",
            &["target", "op"]
        )
        .unwrap();
    }

    pub fn record_external_call_success(
        target: &'static str,
        op: &'static str,
        duration: Duration,
    ) {
        EXTERNAL_SUCCESS_SECONDS
            .with_label_values(&[target, op])
            .observe(duration.as_secs_f64());
    }

    pub fn record_external_call_failure(target: &'static str, op: &'static str) {
        EXTERNAL_FAILURE_TOTAL.with_label_values(&[target, op]).inc();
    }
}
