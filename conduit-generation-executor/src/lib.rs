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

//! The asynchronous generation pipeline of the Conduit gateway: durable task
//! records, a Redis-backed work queue with claim leases, an event-driven
//! orchestrator executing provider calls with retries and failover,
//! distributed cache statistics, quality tracking, deterministic pricing and
//! webhook delivery.
//!
//! HTTP ingress, provider wire adapters, object storage and the billing
//! ledger are external collaborators; their seams are the traits in
//! [`services::providers`], [`services::media`] and
//! [`services::virtual_key`].

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod services;
pub mod storage;

#[cfg(test)]
test_r::enable!();
