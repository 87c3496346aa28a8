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

pub mod memory;
pub mod redis;

use crate::storage::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

/// Logical partitions of the key/value store. Each namespace maps to a fixed
/// key prefix in the Redis backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyValueStorageNamespace {
    Tasks,
    Queue,
    CacheStats,
    Resilience,
    Pricing,
}

/// Namespaced key/value storage with the primitives the pipeline needs:
/// plain values with TTL, set-if-absent leases, version-fenced writes,
/// atomic hash counters, scored sets and plain sets. Implementations must
/// make `increment_field`, `set_if_absent` and `set_if_version` atomic;
/// nothing here takes cross-key locks.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn set(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        entity_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), StorageError>;

    /// True iff the key was created; an existing live key is left untouched.
    async fn set_if_absent(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        entity_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    /// Compare-and-swap on the entity's `version`: the stored value must be
    /// JSON with a top-level numeric `version` field, and the write only
    /// lands while that field still equals `expected_version`. False on a
    /// version mismatch, an absent key, or an undecodable stored value; the
    /// caller reloads and decides.
    async fn set_if_version(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        entity_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        value: &[u8],
        expected_version: u64,
        ttl: Option<Duration>,
    ) -> Result<bool, StorageError>;

    async fn get(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        entity_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<Option<Bytes>, StorageError>;

    async fn del(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<(), StorageError>;

    async fn exists(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<bool, StorageError>;

    async fn expire(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    /// Atomic increment of a hash field; creates hash and field as needed and
    /// returns the new value.
    async fn increment_field(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StorageError>;

    async fn get_fields(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<HashMap<String, String>, StorageError>;

    async fn add_to_sorted_set(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        score: f64,
        member: &str,
    ) -> Result<(), StorageError>;

    /// Members with `min <= score <= max`, ascending by score, at most
    /// `count`.
    async fn sorted_set_range_by_score(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        min: f64,
        max: f64,
        count: usize,
    ) -> Result<Vec<String>, StorageError>;

    /// All members with their scores, ascending by score.
    async fn sorted_set_entries(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<Vec<(String, f64)>, StorageError>;

    /// True iff the member was present.
    async fn remove_from_sorted_set(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        member: &str,
    ) -> Result<bool, StorageError>;

    async fn sorted_set_cardinality(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<u64, StorageError>;

    /// Keeps only the `max_entries` members with the highest scores.
    async fn trim_sorted_set(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        max_entries: usize,
    ) -> Result<(), StorageError>;

    async fn add_to_set(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        member: &str,
    ) -> Result<(), StorageError>;

    async fn remove_from_set(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        member: &str,
    ) -> Result<(), StorageError>;

    async fn members_of_set(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<Vec<String>, StorageError>;
}

pub(crate) fn namespace_prefix(namespace: KeyValueStorageNamespace) -> &'static str {
    match namespace {
        KeyValueStorageNamespace::Tasks => "conduit:tasks",
        KeyValueStorageNamespace::Queue => "conduit:imagegen",
        KeyValueStorageNamespace::CacheStats => "conduit:cache",
        KeyValueStorageNamespace::Resilience => "conduit:resilience",
        KeyValueStorageNamespace::Pricing => "conduit:pricing",
    }
}

pub(crate) fn composite_key(namespace: KeyValueStorageNamespace, key: &str) -> String {
    format!("{}:{}", namespace_prefix(namespace), key)
}
