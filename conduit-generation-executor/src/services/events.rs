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

use crate::model::event::EventEnvelope;
use crate::storage::pubsub::{PubSubStorage, Subscription};
use crate::storage::StorageError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

const SVC_NAME: &str = "events";
const FIREHOSE_CHANNEL: &str = "conduit:events:all";

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Event serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Topic-based publish/subscribe for lifecycle events. At-least-once,
/// best-effort ordering; the task store remains the system of record.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), EventBusError>;

    /// All topics, one subscription.
    async fn subscribe_all(&self) -> Result<EventSubscription, EventBusError>;

    async fn subscribe_topic(&self, topic: &str) -> Result<EventSubscription, EventBusError>;
}

pub struct EventSubscription {
    inner: Subscription,
}

impl EventSubscription {
    /// Next decodable event; undecodable payloads are dropped with a warning
    /// rather than poisoning the subscription.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        loop {
            let payload = self.inner.recv().await?;
            match serde_json::from_slice::<EventEnvelope>(&payload) {
                Ok(envelope) => return Some(envelope),
                Err(err) => {
                    warn!("dropping undecodable event: {err}");
                }
            }
        }
    }
}

/// Event bus over any pub/sub backend: each event goes out on its topic
/// channel and on the firehose channel subscribers without a topic filter
/// read.
pub struct PubSubEventBus {
    pubsub: Arc<dyn PubSubStorage>,
}

impl PubSubEventBus {
    pub fn new(pubsub: Arc<dyn PubSubStorage>) -> Self {
        Self { pubsub }
    }

    fn topic_channel(topic: &str) -> String {
        format!("conduit:events:{topic}")
    }
}

#[async_trait]
impl EventBus for PubSubEventBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<(), EventBusError> {
        let payload = serde_json::to_vec(&envelope)?;
        let topic_channel = Self::topic_channel(envelope.event.topic());
        self.pubsub
            .publish(SVC_NAME, "publish", &topic_channel, &payload)
            .await?;
        self.pubsub
            .publish(SVC_NAME, "publish", FIREHOSE_CHANNEL, &payload)
            .await?;
        Ok(())
    }

    async fn subscribe_all(&self) -> Result<EventSubscription, EventBusError> {
        let inner = self.pubsub.subscribe(FIREHOSE_CHANNEL).await?;
        Ok(EventSubscription { inner })
    }

    async fn subscribe_topic(&self, topic: &str) -> Result<EventSubscription, EventBusError> {
        let inner = self.pubsub.subscribe(&Self::topic_channel(topic)).await?;
        Ok(EventSubscription { inner })
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::model::event::LifecycleEvent;
    use crate::storage::pubsub::memory::InMemoryPubSub;
    use conduit_common::model::TaskId;

    #[test]
    async fn publish_reaches_topic_and_firehose_subscribers() {
        let bus = PubSubEventBus::new(Arc::new(InMemoryPubSub::new()));
        let mut all = bus.subscribe_all().await.unwrap();
        let mut completed = bus.subscribe_topic("TaskCompleted").await.unwrap();

        let task_id = TaskId::generate();
        bus.publish(EventEnvelope::new(LifecycleEvent::TaskCompleted { task_id }))
            .await
            .unwrap();

        let from_all = all.recv().await.unwrap();
        let from_topic = completed.recv().await.unwrap();
        assert_eq!(from_all.event, LifecycleEvent::TaskCompleted { task_id });
        assert_eq!(from_all.event, from_topic.event);
    }

    #[test]
    async fn topic_subscription_filters_other_events() {
        let bus = PubSubEventBus::new(Arc::new(InMemoryPubSub::new()));
        let mut failed = bus.subscribe_topic("TaskFailed").await.unwrap();

        let completed_id = TaskId::generate();
        let failed_id = TaskId::generate();
        bus.publish(EventEnvelope::new(LifecycleEvent::TaskCompleted {
            task_id: completed_id,
        }))
        .await
        .unwrap();
        bus.publish(EventEnvelope::new(LifecycleEvent::TaskFailed {
            task_id: failed_id,
            error: "boom".to_string(),
            will_retry: false,
        }))
        .await
        .unwrap();

        let event = failed.recv().await.unwrap();
        assert_eq!(
            event.event,
            LifecycleEvent::TaskFailed {
                task_id: failed_id,
                error: "boom".to_string(),
                will_retry: false,
            }
        );
    }
}
