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
use conduit_common::redis::RedisPool;
use std::collections::HashMap;
use std::time::Duration;

/// Server-side compare-and-swap on the entity's `version` field. Decoding
/// and the comparison run inside Redis, so the check and the write are one
/// atomic step.
const SET_IF_VERSION_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return 0 end
local ok, decoded = pcall(cjson.decode, current)
if not ok or type(decoded) ~= 'table' then return 0 end
if decoded.version ~= tonumber(ARGV[1]) then return 0 end
if ARGV[3] == '0' then
    redis.call('SET', KEYS[1], ARGV[2])
else
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
end
return 1
"#;

pub struct RedisKeyValueStorage {
    redis: RedisPool,
}

impl RedisKeyValueStorage {
    pub fn new(redis: RedisPool) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl KeyValueStorage for RedisKeyValueStorage {
    async fn set(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        _entity_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        match ttl {
            Some(ttl) => api.set_px(&key, value.to_vec(), ttl).await?,
            None => api.set(&key, value.to_vec()).await?,
        }
        Ok(())
    }

    async fn set_if_absent(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        _entity_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        Ok(api.set_nx_px(&key, value.to_vec(), ttl).await?)
    }

    async fn set_if_version(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        _entity_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        value: &[u8],
        expected_version: u64,
        ttl: Option<Duration>,
    ) -> Result<bool, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        let ttl_millis = ttl.map(|ttl| ttl.as_millis() as u64).unwrap_or(0);
        let swapped = api
            .eval_int(
                SET_IF_VERSION_SCRIPT,
                &[&key],
                &[
                    expected_version.to_string().into_bytes(),
                    value.to_vec(),
                    ttl_millis.to_string().into_bytes(),
                ],
            )
            .await?;
        Ok(swapped == 1)
    }

    async fn get(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        _entity_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<Option<Bytes>, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        Ok(api.get(&key).await?.map(Bytes::from))
    }

    async fn del(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<(), StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        api.del(&key).await?;
        Ok(())
    }

    async fn exists(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<bool, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        Ok(api.exists(&key).await?)
    }

    async fn expire(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        Ok(api.pexpire(&key, ttl).await?)
    }

    async fn increment_field(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        Ok(api.hincrby(&key, field, delta).await?)
    }

    async fn get_fields(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<HashMap<String, String>, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        Ok(api.hgetall(&key).await?)
    }

    async fn add_to_sorted_set(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        score: f64,
        member: &str,
    ) -> Result<(), StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        api.zadd(&key, score, member).await?;
        Ok(())
    }

    async fn sorted_set_range_by_score(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        min: f64,
        max: f64,
        count: usize,
    ) -> Result<Vec<String>, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        Ok(api
            .zrangebyscore_limit(&key, min, max, 0, count as isize)
            .await?)
    }

    async fn sorted_set_entries(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<Vec<(String, f64)>, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        Ok(api.zrange_withscores(&key, 0, -1).await?)
    }

    async fn remove_from_sorted_set(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        member: &str,
    ) -> Result<bool, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        Ok(api.zrem(&key, member).await? > 0)
    }

    async fn sorted_set_cardinality(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<u64, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        Ok(api.zcard(&key).await?)
    }

    async fn trim_sorted_set(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        max_entries: usize,
    ) -> Result<(), StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        // Highest scores are the newest entries; drop everything below the
        // last `max_entries` ranks.
        api.zremrangebyrank(&key, 0, -(max_entries as isize) - 1)
            .await?;
        Ok(())
    }

    async fn add_to_set(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        member: &str,
    ) -> Result<(), StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        api.sadd(&key, member).await?;
        Ok(())
    }

    async fn remove_from_set(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
        member: &str,
    ) -> Result<(), StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        api.srem(&key, member).await?;
        Ok(())
    }

    async fn members_of_set(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        namespace: KeyValueStorageNamespace,
        key: &str,
    ) -> Result<Vec<String>, StorageError> {
        let api = self.redis.with(svc_name, api_name);
        let key = composite_key(namespace, key);
        Ok(api.smembers(&key).await?)
    }
}
