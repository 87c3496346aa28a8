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

pub mod keyvalue;
pub mod pubsub;
pub mod stream;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Other(String),
}

/// Serializes an entity for storage, recording its size in the metrics.
pub fn serialize_entity<T: serde::Serialize>(
    svc_name: &'static str,
    entity_name: &'static str,
    value: &T,
) -> Result<Vec<u8>, StorageError> {
    let bytes = serde_json::to_vec(value)?;
    conduit_common::metrics::redis::record_redis_serialized_size(svc_name, entity_name, bytes.len());
    Ok(bytes)
}

pub fn deserialize_entity<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    Ok(serde_json::from_slice(bytes)?)
}
