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
use tokio::sync::mpsc;

/// Fire-and-forget broadcast channels. Delivery is best-effort: subscribers
/// that fall behind lose messages, and nothing is persisted. Consumers that
/// need durability reconcile against the task store.
#[async_trait]
pub trait PubSubStorage: Send + Sync {
    async fn publish(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        channel: &str,
        payload: &[u8],
    ) -> Result<(), StorageError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StorageError>;
}

pub struct Subscription {
    receiver: mpsc::Receiver<Bytes>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<Bytes>) -> Self {
        Self { receiver }
    }

    /// None once the publishing side is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }
}
