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

use crate::storage::keyvalue::{composite_key, KeyValueStorage, KeyValueStorageNamespace};
use crate::storage::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Single-process implementation used by tests and the in-memory bootstrap
/// mode. TTLs are enforced lazily on access.
#[derive(Default)]
pub struct InMemoryKeyValueStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, (Bytes, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, i64>>,
    sorted_sets: HashMap<String, HashMap<String, f64>>,
    sets: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn live_value(&mut self, key: &str) -> Option<Bytes> {
        match self.values.get(key) {
            Some((_, Some(expires_at))) if *expires_at <= Instant::now() => {
                self.values.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

impl InMemoryKeyValueStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_entries(members: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut entries: Vec<(String, f64)> = members
        .iter()
        .map(|(member, score)| (member.clone(), *score))
        .collect();
    entries.sort_by(|(m1, s1), (m2, s2)| {
        s1.partial_cmp(s2).unwrap_or(Ordering::Equal).then(m1.cmp(m2))
    });
    entries
}

#[async_trait]
impl KeyValueStorage for InMemoryKeyValueStorage {
    async fn set(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        _entity_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.values.insert(
            composite_key(namespace, key),
            (
                Bytes::copy_from_slice(value),
                ttl.map(|ttl| Instant::now() + ttl),
            ),
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        _entity_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let full_key = composite_key(namespace, key);
        let mut inner = self.inner.lock().unwrap();
        if inner.live_value(&full_key).is_some() {
            Ok(false)
        } else {
            inner.values.insert(
                full_key,
                (Bytes::copy_from_slice(value), Some(Instant::now() + ttl)),
            );
            Ok(true)
        }
    }

    async fn set_if_version(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        _entity_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        value: &[u8],
        expected_version: u64,
        ttl: Option<Duration>,
    ) -> Result<bool, StorageError> {
        let full_key = composite_key(namespace, key);
        let mut inner = self.inner.lock().unwrap();
        let current = match inner.live_value(&full_key) {
            Some(current) => current,
            None => return Ok(false),
        };
        let stored_version = serde_json::from_slice::<serde_json::Value>(&current)
            .ok()
            .and_then(|decoded| decoded.get("version").and_then(|version| version.as_u64()));
        if stored_version != Some(expected_version) {
            return Ok(false);
        }
        inner.values.insert(
            full_key,
            (
                Bytes::copy_from_slice(value),
                ttl.map(|ttl| Instant::now() + ttl),
            ),
        );
        Ok(true)
    }

    async fn get(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        _entity_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<Option<Bytes>, StorageError> {
        let full_key = composite_key(namespace, key);
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.live_value(&full_key))
    }

    async fn del(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<(), StorageError> {
        let full_key = composite_key(namespace, key);
        let mut inner = self.inner.lock().unwrap();
        inner.values.remove(&full_key);
        inner.hashes.remove(&full_key);
        inner.sorted_sets.remove(&full_key);
        inner.sets.remove(&full_key);
        Ok(())
    }

    async fn exists(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<bool, StorageError> {
        let full_key = composite_key(namespace, key);
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.live_value(&full_key).is_some()
            || inner.hashes.contains_key(&full_key)
            || inner.sorted_sets.contains_key(&full_key)
            || inner.sets.contains_key(&full_key))
    }

    async fn expire(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let full_key = composite_key(namespace, key);
        let mut inner = self.inner.lock().unwrap();
        if inner.live_value(&full_key).is_some() {
            if let Some(entry) = inner.values.get_mut(&full_key) {
                entry.1 = Some(Instant::now() + ttl);
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn increment_field(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StorageError> {
        let full_key = composite_key(namespace, key);
        let mut inner = self.inner.lock().unwrap();
        let hash = inner.hashes.entry(full_key).or_default();
        let value = hash.entry(field.to_string()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn get_fields(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<HashMap<String, String>, StorageError> {
        let full_key = composite_key(namespace, key);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .hashes
            .get(&full_key)
            .map(|hash| {
                hash.iter()
                    .map(|(field, value)| (field.clone(), value.to_string()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn add_to_sorted_set(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        score: f64,
        member: &str,
    ) -> Result<(), StorageError> {
        let full_key = composite_key(namespace, key);
        let mut inner = self.inner.lock().unwrap();
        inner
            .sorted_sets
            .entry(full_key)
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn sorted_set_range_by_score(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        min: f64,
        max: f64,
        count: usize,
    ) -> Result<Vec<String>, StorageError> {
        let full_key = composite_key(namespace, key);
        let inner = self.inner.lock().unwrap();
        let members = match inner.sorted_sets.get(&full_key) {
            Some(members) => members,
            None => return Ok(Vec::new()),
        };
        Ok(sorted_entries(members)
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .take(count)
            .map(|(member, _)| member)
            .collect())
    }

    async fn sorted_set_entries(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<Vec<(String, f64)>, StorageError> {
        let full_key = composite_key(namespace, key);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sorted_sets
            .get(&full_key)
            .map(sorted_entries)
            .unwrap_or_default())
    }

    async fn remove_from_sorted_set(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        member: &str,
    ) -> Result<bool, StorageError> {
        let full_key = composite_key(namespace, key);
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .sorted_sets
            .get_mut(&full_key)
            .map(|members| members.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn sorted_set_cardinality(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<u64, StorageError> {
        let full_key = composite_key(namespace, key);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sorted_sets
            .get(&full_key)
            .map(|members| members.len() as u64)
            .unwrap_or(0))
    }

    async fn trim_sorted_set(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        max_entries: usize,
    ) -> Result<(), StorageError> {
        let full_key = composite_key(namespace, key);
        let mut inner = self.inner.lock().unwrap();
        if let Some(members) = inner.sorted_sets.get_mut(&full_key) {
            if members.len() > max_entries {
                let entries = sorted_entries(members);
                let excess = entries.len() - max_entries;
                for (member, _) in entries.into_iter().take(excess) {
                    members.remove(&member);
                }
            }
        }
        Ok(())
    }

    async fn add_to_set(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        member: &str,
    ) -> Result<(), StorageError> {
        let full_key = composite_key(namespace, key);
        let mut inner = self.inner.lock().unwrap();
        inner
            .sets
            .entry(full_key)
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_from_set(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        member: &str,
    ) -> Result<(), StorageError> {
        let full_key = composite_key(namespace, key);
        let mut inner = self.inner.lock().unwrap();
        if let Some(members) = inner.sets.get_mut(&full_key) {
            members.remove(member);
        }
        Ok(())
    }

    async fn members_of_set(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<Vec<String>, StorageError> {
        let full_key = composite_key(namespace, key);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sets
            .get(&full_key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }
}
