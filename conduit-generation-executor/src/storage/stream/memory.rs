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

use crate::storage::stream::{
    composite_key, StreamEntry, StreamStorage, StreamStorageNamespace,
};
use crate::storage::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Single-process stream implementation. Consumer groups share one cursor;
/// consumers within a group therefore see disjoint entries, like a Redis
/// consumer group with only new-entry reads.
#[derive(Default)]
pub struct InMemoryStreamStorage {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(String, Bytes)>,
    next_id: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    cursor: usize,
    pending: HashSet<String>,
}

impl InMemoryStreamStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamStorage for InMemoryStreamStorage {
    async fn append(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        _entity_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
        payload: &[u8],
    ) -> Result<String, StorageError> {
        let key = composite_key(namespace, stream);
        let mut inner = self.inner.lock().unwrap();
        let state = inner.streams.entry(key).or_default();
        let id = format!("{:020}-0", state.next_id);
        state.next_id += 1;
        state
            .entries
            .push((id.clone(), Bytes::copy_from_slice(payload)));
        Ok(id)
    }

    async fn ensure_group(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
        group: &str,
    ) -> Result<(), StorageError> {
        let key = composite_key(namespace, stream);
        let mut inner = self.inner.lock().unwrap();
        let state = inner.streams.entry(key).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let key = composite_key(namespace, stream);
        let mut inner = self.inner.lock().unwrap();
        let state = match inner.streams.get_mut(&key) {
            Some(state) => state,
            None => return Ok(Vec::new()),
        };
        let group_state = state.groups.entry(group.to_string()).or_default();

        let mut result = Vec::new();
        while result.len() < count && group_state.cursor < state.entries.len() {
            let (id, payload) = &state.entries[group_state.cursor];
            group_state.cursor += 1;
            group_state.pending.insert(id.clone());
            result.push(StreamEntry {
                id: id.clone(),
                payload: payload.clone(),
            });
        }
        Ok(result)
    }

    async fn ack(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> Result<(), StorageError> {
        let key = composite_key(namespace, stream);
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.streams.get_mut(&key) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(entry_id);
            }
        }
        Ok(())
    }

    async fn length(
        &self,
        _svc_name: &'static str,
        _api_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
    ) -> Result<u64, StorageError> {
        let key = composite_key(namespace, stream);
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .streams
            .get(&key)
            .map(|state| state.entries.len() as u64)
            .unwrap_or(0))
    }
}
