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
use conduit_common::model::ProviderId;
use conduit_generation_executor::model::quality::{QualityAxis, QualitySample, TrendDirection};
use conduit_generation_executor::services::quality::{QualityTracker, QualityTrackerConfig};
use test_r::test;

fn sample(confidence: f64, word_error_rate: f64) -> QualitySample {
    QualitySample {
        confidence,
        accuracy: confidence,
        word_error_rate,
        timestamp: Utc::now(),
    }
}

fn tracker() -> QualityTracker {
    QualityTracker::new(QualityTrackerConfig::default())
}

#[test]
fn derived_metrics() {
    let tracker = tracker();
    let provider = ProviderId::new("openai");
    for confidence in [0.5, 0.8, 0.95, 0.99] {
        tracker.record(&provider, "whisper-1", "en", sample(confidence, 0.1));
    }

    let metrics = tracker.metrics(QualityAxis::Provider, "openai").unwrap();
    check!(metrics.sample_count == 4);
    check!(metrics.min_confidence == 0.5);
    check!(metrics.max_confidence == 0.99);
    check!(metrics.low_confidence_rate == 0.25);
    check!(metrics.high_confidence_rate == 0.5);
    check!((metrics.average_confidence - 0.81).abs() < 0.001);
    check!((metrics.average_word_error_rate - 0.1).abs() < 1e-9);
}

#[test]
fn axes_are_tracked_separately() {
    let tracker = tracker();
    tracker.record(&ProviderId::new("openai"), "whisper-1", "en", sample(0.9, 0.1));
    tracker.record(&ProviderId::new("deepgram"), "nova-2", "de", sample(0.6, 0.3));

    check!(tracker.metrics(QualityAxis::Provider, "openai").is_some());
    check!(tracker.metrics(QualityAxis::Provider, "deepgram").is_some());
    check!(tracker.metrics(QualityAxis::Model, "whisper-1").unwrap().sample_count == 1);
    check!(tracker.metrics(QualityAxis::Language, "en").unwrap().sample_count == 1);
    check!(tracker.metrics(QualityAxis::Language, "fr").is_none());
}

#[test]
fn improving_and_declining_trends() {
    let tracker = tracker();
    let improving = ProviderId::new("up");
    for confidence in [0.5, 0.5, 0.5, 0.5, 0.5, 0.9, 0.9, 0.9, 0.9, 0.9] {
        tracker.record(&improving, "m", "en", sample(confidence, 0.1));
    }
    let declining = ProviderId::new("down");
    for confidence in [0.9, 0.9, 0.9, 0.9, 0.9, 0.5, 0.5, 0.5, 0.5, 0.5] {
        tracker.record(&declining, "m2", "de", sample(confidence, 0.1));
    }
    let stable = ProviderId::new("flat");
    for _ in 0..10 {
        tracker.record(&stable, "m3", "fr", sample(0.9, 0.1));
    }

    check!(
        tracker.metrics(QualityAxis::Provider, "up").unwrap().trend
            == TrendDirection::Improving
    );
    check!(
        tracker.metrics(QualityAxis::Provider, "down").unwrap().trend
            == TrendDirection::Declining
    );
    check!(
        tracker.metrics(QualityAxis::Provider, "flat").unwrap().trend
            == TrendDirection::Stable
    );
}

#[test]
fn few_samples_are_stable() {
    let tracker = tracker();
    let provider = ProviderId::new("new");
    for confidence in [0.2, 0.9] {
        tracker.record(&provider, "m", "en", sample(confidence, 0.1));
    }
    check!(tracker.metrics(QualityAxis::Provider, "new").unwrap().trend == TrendDirection::Stable);
}

#[test]
fn recommendations_for_weak_providers_and_languages() {
    let tracker = tracker();
    tracker.record(&ProviderId::new("weak"), "m", "en", sample(0.5, 0.05));
    tracker.record(&ProviderId::new("strong"), "m2", "sw", sample(0.95, 0.4));

    let recommendations = tracker.recommendations();

    check!(recommendations.len() == 2);
    check!(recommendations
        .iter()
        .any(|r| r.axis == QualityAxis::Provider && r.key == "weak"));
    check!(recommendations
        .iter()
        .any(|r| r.axis == QualityAxis::Language && r.key == "sw"));
}

#[test]
fn sweep_drops_expired_samples() {
    let tracker = tracker();
    let provider = ProviderId::new("openai");
    let old = QualitySample {
        confidence: 0.9,
        accuracy: 0.9,
        word_error_rate: 0.1,
        timestamp: Utc::now() - chrono::Duration::hours(25),
    };
    tracker.record(&provider, "whisper-1", "en", old);
    tracker.record(&provider, "whisper-1", "en", sample(0.8, 0.1));

    // The old sample lands on three axes.
    let removed = tracker.sweep_expired();
    check!(removed == 3);
    check!(
        tracker
            .metrics(QualityAxis::Provider, "openai")
            .unwrap()
            .sample_count
            == 1
    );
}
