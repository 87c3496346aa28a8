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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStorageNamespace {
    WorkQueue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub payload: Bytes,
}

/// Append-only streams with consumer groups: at-least-once delivery of each
/// entry to exactly one consumer of a group, with explicit acknowledgement.
/// Entry ids order lexicographically in append order.
#[async_trait]
pub trait StreamStorage: Send + Sync {
    async fn append(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        entity_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
        payload: &[u8],
    ) -> Result<String, StorageError>;

    /// Idempotent; creates the stream when missing.
    async fn ensure_group(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
        group: &str,
    ) -> Result<(), StorageError>;

    /// Next unseen entries for the group; never blocks.
    async fn read_group(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError>;

    async fn ack(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> Result<(), StorageError>;

    async fn length(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
    ) -> Result<u64, StorageError>;
}

pub(crate) fn composite_key(namespace: StreamStorageNamespace, stream: &str) -> String {
    match namespace {
        StreamStorageNamespace::WorkQueue => format!("conduit:imagegen:{stream}"),
    }
}
