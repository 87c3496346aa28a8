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

use conduit_generation_executor::storage::keyvalue::memory::InMemoryKeyValueStorage;
use conduit_generation_executor::storage::keyvalue::KeyValueStorage;

pub(crate) trait GetKeyValueStorage {
    fn get_key_value_storage(&self) -> &dyn KeyValueStorage;
}

struct InMemoryKeyValueStorageWrapper {
    kvs: InMemoryKeyValueStorage,
}

impl GetKeyValueStorage for InMemoryKeyValueStorageWrapper {
    fn get_key_value_storage(&self) -> &dyn KeyValueStorage {
        &self.kvs
    }
}

pub(crate) async fn in_memory_storage() -> impl GetKeyValueStorage {
    InMemoryKeyValueStorageWrapper {
        kvs: InMemoryKeyValueStorage::new(),
    }
}

macro_rules! test_key_value_storage {
    ( $name:ident, $init:expr ) => {
        mod $name {
            use assert2::check;
            use conduit_generation_executor::storage::keyvalue::KeyValueStorageNamespace;
            use std::time::Duration;
            use test_r::test;

            use crate::key_value_storage::GetKeyValueStorage;

            fn ns() -> KeyValueStorageNamespace {
                KeyValueStorageNamespace::Tasks
            }

            fn ns2() -> KeyValueStorageNamespace {
                KeyValueStorageNamespace::Queue
            }

            #[test]
            async fn get_set_get() {
                let test = $init.await;
                let kv = test.get_key_value_storage();

                let result1 = kv.get("svc", "api", "entity", ns(), "key1").await.unwrap();
                kv.set("svc", "api", "entity", ns(), "key1", b"value", None)
                    .await
                    .unwrap();
                let result2 = kv.get("svc", "api", "entity", ns(), "key1").await.unwrap();

                check!(result1 == None);
                check!(result2.as_deref() == Some(b"value".as_slice()));
            }

            #[test]
            async fn namespaces_are_separate() {
                let test = $init.await;
                let kv = test.get_key_value_storage();

                kv.set("svc", "api", "entity", ns(), "key1", b"v1", None)
                    .await
                    .unwrap();
                let other = kv.get("svc", "api", "entity", ns2(), "key1").await.unwrap();

                check!(other == None);
            }

            #[test]
            async fn set_if_absent_is_exclusive() {
                let test = $init.await;
                let kv = test.get_key_value_storage();
                let ttl = Duration::from_secs(60);

                let first = kv
                    .set_if_absent("svc", "api", "entity", ns(), "lease", b"w1", ttl)
                    .await
                    .unwrap();
                let second = kv
                    .set_if_absent("svc", "api", "entity", ns(), "lease", b"w2", ttl)
                    .await
                    .unwrap();
                let value = kv.get("svc", "api", "entity", ns(), "lease").await.unwrap();

                check!(first == true);
                check!(second == false);
                check!(value.as_deref() == Some(b"w1".as_slice()));
            }

            #[test]
            async fn set_if_version_is_a_compare_and_swap() {
                let test = $init.await;
                let kv = test.get_key_value_storage();

                // Nothing to fence against on an absent key.
                let missing = kv
                    .set_if_version(
                        "svc",
                        "api",
                        "entity",
                        ns(),
                        "record",
                        br#"{"version":2,"state":"b"}"#,
                        1,
                        None,
                    )
                    .await
                    .unwrap();
                check!(missing == false);

                kv.set(
                    "svc",
                    "api",
                    "entity",
                    ns(),
                    "record",
                    br#"{"version":1,"state":"a"}"#,
                    None,
                )
                .await
                .unwrap();

                let stale = kv
                    .set_if_version(
                        "svc",
                        "api",
                        "entity",
                        ns(),
                        "record",
                        br#"{"version":8,"state":"b"}"#,
                        7,
                        None,
                    )
                    .await
                    .unwrap();
                check!(stale == false);

                let fenced = kv
                    .set_if_version(
                        "svc",
                        "api",
                        "entity",
                        ns(),
                        "record",
                        br#"{"version":2,"state":"b"}"#,
                        1,
                        None,
                    )
                    .await
                    .unwrap();
                check!(fenced == true);
                let value = kv.get("svc", "api", "entity", ns(), "record").await.unwrap();
                check!(value.as_deref() == Some(br#"{"version":2,"state":"b"}"#.as_slice()));

                // The consumed version cannot be swapped against again.
                let replay = kv
                    .set_if_version(
                        "svc",
                        "api",
                        "entity",
                        ns(),
                        "record",
                        br#"{"version":2,"state":"c"}"#,
                        1,
                        None,
                    )
                    .await
                    .unwrap();
                check!(replay == false);
            }

            #[test]
            async fn expired_keys_are_absent() {
                let test = $init.await;
                let kv = test.get_key_value_storage();

                kv.set(
                    "svc",
                    "api",
                    "entity",
                    ns(),
                    "short",
                    b"v",
                    Some(Duration::from_millis(20)),
                )
                .await
                .unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                let value = kv.get("svc", "api", "entity", ns(), "short").await.unwrap();
                let lease = kv
                    .set_if_absent(
                        "svc",
                        "api",
                        "entity",
                        ns(),
                        "short",
                        b"new",
                        Duration::from_secs(60),
                    )
                    .await
                    .unwrap();

                check!(value == None);
                check!(lease == true);
            }

            #[test]
            async fn increment_field_is_cumulative() {
                let test = $init.await;
                let kv = test.get_key_value_storage();

                let one = kv
                    .increment_field("svc", "api", ns(), "counters", "HitCount", 1)
                    .await
                    .unwrap();
                let three = kv
                    .increment_field("svc", "api", ns(), "counters", "HitCount", 2)
                    .await
                    .unwrap();
                let fields = kv.get_fields("svc", "api", ns(), "counters").await.unwrap();

                check!(one == 1);
                check!(three == 3);
                check!(fields.get("HitCount").map(String::as_str) == Some("3"));
            }

            #[test]
            async fn sorted_set_range_and_remove() {
                let test = $init.await;
                let kv = test.get_key_value_storage();

                kv.add_to_sorted_set("svc", "api", ns(), "sched", 100.0, "a")
                    .await
                    .unwrap();
                kv.add_to_sorted_set("svc", "api", ns(), "sched", 50.0, "b")
                    .await
                    .unwrap();
                kv.add_to_sorted_set("svc", "api", ns(), "sched", 200.0, "c")
                    .await
                    .unwrap();

                let due = kv
                    .sorted_set_range_by_score("svc", "api", ns(), "sched", 0.0, 150.0, 10)
                    .await
                    .unwrap();
                let removed = kv
                    .remove_from_sorted_set("svc", "api", ns(), "sched", "b")
                    .await
                    .unwrap();
                let removed_again = kv
                    .remove_from_sorted_set("svc", "api", ns(), "sched", "b")
                    .await
                    .unwrap();
                let cardinality = kv
                    .sorted_set_cardinality("svc", "api", ns(), "sched")
                    .await
                    .unwrap();

                check!(due == vec!["b".to_string(), "a".to_string()]);
                check!(removed == true);
                check!(removed_again == false);
                check!(cardinality == 2);
            }

            #[test]
            async fn trim_sorted_set_keeps_highest_scores() {
                let test = $init.await;
                let kv = test.get_key_value_storage();

                for (score, member) in [(1.0, "a"), (2.0, "b"), (3.0, "c"), (4.0, "d")] {
                    kv.add_to_sorted_set("svc", "api", ns(), "samples", score, member)
                        .await
                        .unwrap();
                }
                kv.trim_sorted_set("svc", "api", ns(), "samples", 2)
                    .await
                    .unwrap();
                let entries = kv
                    .sorted_set_entries("svc", "api", ns(), "samples")
                    .await
                    .unwrap();

                check!(entries == vec![("c".to_string(), 3.0), ("d".to_string(), 4.0)]);
            }

            #[test]
            async fn set_membership() {
                let test = $init.await;
                let kv = test.get_key_value_storage();

                kv.add_to_set("svc", "api", ns(), "index", "a").await.unwrap();
                kv.add_to_set("svc", "api", ns(), "index", "b").await.unwrap();
                kv.add_to_set("svc", "api", ns(), "index", "a").await.unwrap();
                kv.remove_from_set("svc", "api", ns(), "index", "b")
                    .await
                    .unwrap();
                let mut members = kv.members_of_set("svc", "api", ns(), "index").await.unwrap();
                members.sort();

                check!(members == vec!["a".to_string()]);
            }

            #[test]
            async fn delete_removes_all_shapes() {
                let test = $init.await;
                let kv = test.get_key_value_storage();

                kv.set("svc", "api", "entity", ns(), "gone", b"v", None)
                    .await
                    .unwrap();
                kv.del("svc", "api", ns(), "gone").await.unwrap();
                let value = kv.get("svc", "api", "entity", ns(), "gone").await.unwrap();
                let exists = kv.exists("svc", "api", ns(), "gone").await.unwrap();

                check!(value == None);
                check!(exists == false);
            }
        }
    };
}

test_key_value_storage!(in_memory, crate::key_value_storage::in_memory_storage());
