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

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum MediaStoreError {
    #[error("Media store failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaObject {
    pub storage_key: String,
    pub url: String,
    pub size_bytes: u64,
}

/// Object storage seam. Keys are derived from task ids so re-execution of a
/// task overwrites rather than duplicates.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Bytes,
    ) -> Result<MediaObject, MediaStoreError>;
}

/// Test and in-memory bootstrap implementation.
#[derive(Default)]
pub struct InMemoryMediaStore {
    base_url: String,
    objects: Mutex<HashMap<String, (String, Bytes)>>,
}

impl InMemoryMediaStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        let objects = self.objects.lock().unwrap();
        objects.get(key).map(|(_, bytes)| bytes.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MediaStore for InMemoryMediaStore {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        bytes: Bytes,
    ) -> Result<MediaObject, MediaStoreError> {
        let size_bytes = bytes.len() as u64;
        let mut objects = self.objects.lock().unwrap();
        objects.insert(key.to_string(), (content_type.to_string(), bytes));
        Ok(MediaObject {
            storage_key: key.to_string(),
            url: format!("{}/{}", self.base_url, key),
            size_bytes,
        })
    }
}
