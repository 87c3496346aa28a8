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
use conduit_common::redis::RedisPool;

const PAYLOAD_FIELD: &str = "payload";

pub struct RedisStreamStorage {
    redis: RedisPool,
}

impl RedisStreamStorage {
    pub fn new(redis: RedisPool) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl StreamStorage for RedisStreamStorage {
    async fn append(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        _entity_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
        payload: &[u8],
    ) -> Result<String, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, stream);
        Ok(api
            .xadd(&key, &[(PAYLOAD_FIELD, payload.to_vec())])
            .await?)
    }

    async fn ensure_group(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
        group: &str,
    ) -> Result<(), StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, stream);
        api.xgroup_create_mkstream(&key, group).await?;
        Ok(())
    }

    async fn read_group(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, stream);
        let entries = api.xreadgroup(&key, group, consumer, count).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(id, mut fields)| {
                fields.remove(PAYLOAD_FIELD).map(|payload| StreamEntry {
                    id,
                    payload: Bytes::from(payload),
                })
            })
            .collect())
    }

    async fn ack(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
        group: &str,
        entry_id: &str,
    ) -> Result<(), StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, stream);
        api.xack(&key, group, entry_id).await?;
        Ok(())
    }

    async fn length(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: StreamStorageNamespace,
        stream: &str,
    ) -> Result<u64, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, stream);
        Ok(api.xlen(&key).await?)
    }
}
