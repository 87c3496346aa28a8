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

use crate::config::RetryConfig;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{info, warn};

/// Applies the retry policy with exponential backoff and jitter to the given
/// delay.
pub fn jittered_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.delay_for_attempt(attempt);
    match config.max_jitter_factor {
        Some(jitter) if jitter > 0.0 && !base.is_zero() => {
            let factor = rand::rng().random_range(0.0..jitter);
            base + base.mul_f64(factor)
        }
        _ => base,
    }
}

/// Runs `action` until it succeeds, the error is not retriable, or the
/// configured number of attempts is exhausted. The input is borrowed into
/// each attempt so retried calls observe the same arguments.
pub async fn with_retries<In, F, G, R, E>(
    target_label: &'static str,
    op_label: &'static str,
    op_id: Option<String>,
    config: &RetryConfig,
    input: &In,
    action: F,
    is_retriable: G,
) -> Result<R, E>
where
    F: for<'a> Fn(&'a In) -> Pin<Box<dyn Future<Output = Result<R, E>> + 'a + Send>>,
    G: Fn(&E) -> bool,
    E: Display,
{
    let op_id = op_id.unwrap_or_default();
    let mut attempt = 1;
    loop {
        match action(input).await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        target_label,
                        op_label, %op_id, attempt, "operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(error) if attempt < config.max_attempts && is_retriable(&error) => {
                let delay = jittered_delay(config, attempt + 1);
                warn!(
                    target_label,
                    op_label,
                    %op_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed with {error}, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                warn!(
                    target_label,
                    op_label, %op_id, attempt, "operation failed with {error}, giving up"
                );
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use crate::config::RetryConfig;
    use crate::retries::with_retries;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
            max_jitter_factor: None,
        }
    }

    #[test]
    async fn succeeds_after_transient_failures() {
        let counter = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries(
            "test",
            "flaky",
            None,
            &fast_config(5),
            &counter,
            |counter| {
                Box::pin(async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(n)
                    }
                })
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(2));
    }

    #[test]
    async fn gives_up_on_non_retriable() {
        let counter = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries(
            "test",
            "fatal",
            None,
            &fast_config(5),
            &counter,
            |counter| {
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("fatal".to_string())
                })
            },
            |_| false,
        )
        .await;

        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    async fn stops_at_max_attempts() {
        let counter = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries(
            "test",
            "always-failing",
            None,
            &fast_config(3),
            &counter,
            |counter| {
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("transient".to_string())
                })
            },
            |_| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
