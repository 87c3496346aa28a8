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

use conduit_generation_executor::storage::stream::memory::InMemoryStreamStorage;
use conduit_generation_executor::storage::stream::StreamStorage;

pub(crate) trait GetStreamStorage {
    fn get_stream_storage(&self) -> &dyn StreamStorage;
}

struct InMemoryStreamStorageWrapper {
    streams: InMemoryStreamStorage,
}

impl GetStreamStorage for InMemoryStreamStorageWrapper {
    fn get_stream_storage(&self) -> &dyn StreamStorage {
        &self.streams
    }
}

pub(crate) async fn in_memory_storage() -> impl GetStreamStorage {
    InMemoryStreamStorageWrapper {
        streams: InMemoryStreamStorage::new(),
    }
}

macro_rules! test_stream_storage {
    ( $name:ident, $init:expr ) => {
        mod $name {
            use assert2::check;
            use conduit_generation_executor::storage::stream::StreamStorageNamespace;
            use test_r::test;

            use crate::stream_storage::GetStreamStorage;

            fn ns() -> StreamStorageNamespace {
                StreamStorageNamespace::WorkQueue
            }

            #[test]
            async fn entries_are_delivered_in_append_order() {
                let test = $init.await;
                let streams = test.get_stream_storage();

                streams
                    .ensure_group("svc", "api", ns(), "stream", "group")
                    .await
                    .unwrap();
                let id1 = streams
                    .append("svc", "api", "entity", ns(), "stream", b"one")
                    .await
                    .unwrap();
                let id2 = streams
                    .append("svc", "api", "entity", ns(), "stream", b"two")
                    .await
                    .unwrap();

                let batch = streams
                    .read_group("svc", "api", ns(), "stream", "group", "c1", 10)
                    .await
                    .unwrap();

                check!(id1 < id2);
                check!(batch.len() == 2);
                check!(batch[0].payload.as_ref() == b"one");
                check!(batch[1].payload.as_ref() == b"two");
            }

            #[test]
            async fn group_members_see_disjoint_entries() {
                let test = $init.await;
                let streams = test.get_stream_storage();

                streams
                    .ensure_group("svc", "api", ns(), "stream", "group")
                    .await
                    .unwrap();
                streams
                    .append("svc", "api", "entity", ns(), "stream", b"one")
                    .await
                    .unwrap();
                streams
                    .append("svc", "api", "entity", ns(), "stream", b"two")
                    .await
                    .unwrap();

                let first = streams
                    .read_group("svc", "api", ns(), "stream", "group", "c1", 1)
                    .await
                    .unwrap();
                let second = streams
                    .read_group("svc", "api", ns(), "stream", "group", "c2", 1)
                    .await
                    .unwrap();
                let third = streams
                    .read_group("svc", "api", ns(), "stream", "group", "c1", 1)
                    .await
                    .unwrap();

                check!(first.len() == 1);
                check!(second.len() == 1);
                check!(first[0].payload != second[0].payload);
                check!(third.is_empty());
            }

            #[test]
            async fn ensure_group_is_idempotent() {
                let test = $init.await;
                let streams = test.get_stream_storage();

                streams
                    .ensure_group("svc", "api", ns(), "stream", "group")
                    .await
                    .unwrap();
                streams
                    .ensure_group("svc", "api", ns(), "stream", "group")
                    .await
                    .unwrap();
                streams
                    .append("svc", "api", "entity", ns(), "stream", b"one")
                    .await
                    .unwrap();

                let batch = streams
                    .read_group("svc", "api", ns(), "stream", "group", "c1", 10)
                    .await
                    .unwrap();

                check!(batch.len() == 1);
            }

            #[test]
            async fn ack_and_length() {
                let test = $init.await;
                let streams = test.get_stream_storage();

                streams
                    .ensure_group("svc", "api", ns(), "stream", "group")
                    .await
                    .unwrap();
                let id = streams
                    .append("svc", "api", "entity", ns(), "stream", b"one")
                    .await
                    .unwrap();
                let _ = streams
                    .read_group("svc", "api", ns(), "stream", "group", "c1", 1)
                    .await
                    .unwrap();
                streams
                    .ack("svc", "api", ns(), "stream", "group", &id)
                    .await
                    .unwrap();
                let length = streams.length("svc", "api", ns(), "stream").await.unwrap();

                check!(length == 1);
            }
        }
    };
}

test_stream_storage!(in_memory, crate::stream_storage::in_memory_storage());
