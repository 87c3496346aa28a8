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

use crate::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub json: bool,
    pub pretty: bool,
    pub ansi: bool,
    pub without_time: bool,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json: false,
            pretty: false,
            ansi: true,
            without_time: false,
        }
    }

    pub fn production(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json: true,
            pretty: false,
            ansi: false,
            without_time: false,
        }
    }

    pub fn test_pretty_without_time(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json: false,
            pretty: true,
            ansi: true,
            without_time: true,
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("CONDUIT_TRACING_JSON") {
            self.json = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Ok(value) = std::env::var("CONDUIT_TRACING_ANSI") {
            self.ansi = value == "1" || value.eq_ignore_ascii_case("true");
        }
        self
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local_dev("conduit")
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "service name: {}", self.service_name);
        let _ = writeln!(&mut result, "json: {}", self.json);
        let _ = writeln!(&mut result, "pretty: {}", self.pretty);
        result
    }
}

pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    init_tracing(config, "info");
}

pub fn init_tracing_with_default_debug_env_filter(config: &TracingConfig) {
    init_tracing(config, "debug");
}

/// Installs the global subscriber. `RUST_LOG` wins over the given default
/// directive. Safe to call more than once; later calls are no-ops.
pub fn init_tracing(config: &TracingConfig, default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive.to_string()));

    if config.json {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init();
    } else if config.pretty {
        if config.without_time {
            let _ = tracing_subscriber::fmt()
                .pretty()
                .with_ansi(config.ansi)
                .without_time()
                .with_env_filter(filter)
                .try_init();
        } else {
            let _ = tracing_subscriber::fmt()
                .pretty()
                .with_ansi(config.ansi)
                .with_env_filter(filter)
                .try_init();
        }
    } else {
        let _ = tracing_subscriber::fmt()
            .with_ansi(config.ansi)
            .with_env_filter(filter)
            .try_init();
    }
}
