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

use crate::storage::pubsub::{PubSubStorage, Subscription};
use crate::storage::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use conduit_common::redis::RedisPool;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::warn;

const CHANNEL_CAPACITY: usize = 1024;

pub struct RedisPubSub {
    redis: RedisPool,
}

impl RedisPubSub {
    pub fn new(redis: RedisPool) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl PubSubStorage for RedisPubSub {
    async fn publish(
        &self,
        svc_name: &'static str,
        api_name: &'static str,
        channel: &str,
        payload: &[u8],
    ) -> Result<(), StorageError> {
        let api = self.redis.with(svc_name, api_name);
        api.publish(channel, payload.to_vec()).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StorageError> {
        let mut pubsub = self.redis.subscriber().await?;
        let channel_name = self.redis.prefixed(channel);
        pubsub.subscribe(&channel_name).await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let payload = Bytes::copy_from_slice(message.get_payload_bytes());
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            warn!(channel = %channel_name, "redis pub/sub stream closed");
        });
        Ok(Subscription::new(rx))
    }
}
