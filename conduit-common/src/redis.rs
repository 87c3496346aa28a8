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

use crate::config::RedisConfig;
use crate::metrics::redis::{record_redis_failure, record_redis_success};
use redis::aio::ConnectionManager;
use redis::streams::StreamReadReply;
use redis::{Cmd, FromRedisValue, RedisError, RedisResult};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Shared multiplexed Redis connection with an optional key prefix. All
/// commands go through [`RedisLabelledApi`] so that every call is attributed
/// to a service and api in the metrics.
#[derive(Clone)]
pub struct RedisPool {
    client: redis::Client,
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisPool {
    pub async fn configured(config: &RedisConfig) -> Result<RedisPool, RedisError> {
        let client = redis::Client::open(config.url())?;
        let connection = client.get_connection_manager().await?;
        debug!(
            "Connected to redis at {}:{} (database {})",
            config.host, config.port, config.database
        );
        Ok(RedisPool {
            client,
            connection,
            key_prefix: config.key_prefix.clone(),
        })
    }

    pub fn with(&self, svc_name: &'static str, api_name: &'static str) -> RedisLabelledApi {
        RedisLabelledApi {
            svc_name,
            api_name,
            connection: self.connection.clone(),
            key_prefix: self.key_prefix.clone(),
        }
    }

    /// Applies the pool's key prefix; pub/sub subscribers need it because
    /// published channel names are prefixed the same way as keys.
    pub fn prefixed(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    /// A dedicated pub/sub connection. Subscriptions cannot share the
    /// multiplexed command connection.
    pub async fn subscriber(&self) -> RedisResult<redis::aio::PubSub> {
        self.client.get_async_pubsub().await
    }
}

pub struct RedisLabelledApi {
    svc_name: &'static str,
    api_name: &'static str,
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisLabelledApi {
    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn execute<T: FromRedisValue>(
        &self,
        cmd_name: &'static str,
        cmd: &Cmd,
    ) -> RedisResult<T> {
        let start = Instant::now();
        let mut connection = self.connection.clone();
        let result = cmd.query_async(&mut connection).await;
        match &result {
            Ok(_) => record_redis_success(self.svc_name, self.api_name, cmd_name, start.elapsed()),
            Err(_) => record_redis_failure(self.svc_name, self.api_name, cmd_name),
        }
        result
    }

    pub async fn set(&self, key: &str, value: Vec<u8>) -> RedisResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.prefixed(key)).arg(value);
        self.execute("SET", &cmd).await
    }

    pub async fn set_px(&self, key: &str, value: Vec<u8>, ttl: Duration) -> RedisResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.prefixed(key))
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64);
        self.execute("SET", &cmd).await
    }

    /// SET NX PX; true iff the key was newly created.
    pub async fn set_nx_px(&self, key: &str, value: Vec<u8>, ttl: Duration) -> RedisResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.prefixed(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64);
        let result: Option<String> = self.execute("SET", &cmd).await?;
        Ok(result.is_some())
    }

    pub async fn get(&self, key: &str) -> RedisResult<Option<Vec<u8>>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(self.prefixed(key));
        self.execute("GET", &cmd).await
    }

    pub async fn del(&self, key: &str) -> RedisResult<u64> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(self.prefixed(key));
        self.execute("DEL", &cmd).await
    }

    pub async fn exists(&self, key: &str) -> RedisResult<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(self.prefixed(key));
        self.execute("EXISTS", &cmd).await
    }

    pub async fn pexpire(&self, key: &str, ttl: Duration) -> RedisResult<bool> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(self.prefixed(key)).arg(ttl.as_millis() as u64);
        self.execute("PEXPIRE", &cmd).await
    }

    pub async fn hincrby(&self, key: &str, field: &str, delta: i64) -> RedisResult<i64> {
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(self.prefixed(key)).arg(field).arg(delta);
        self.execute("HINCRBY", &cmd).await
    }

    pub async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> RedisResult<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.prefixed(key)).arg(field).arg(value);
        self.execute("HSET", &cmd).await
    }

    pub async fn hget(&self, key: &str, field: &str) -> RedisResult<Option<Vec<u8>>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(self.prefixed(key)).arg(field);
        self.execute("HGET", &cmd).await
    }

    pub async fn hgetall(&self, key: &str) -> RedisResult<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(self.prefixed(key));
        self.execute("HGETALL", &cmd).await
    }

    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> RedisResult<u64> {
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(self.prefixed(key)).arg(score).arg(member);
        self.execute("ZADD", &cmd).await
    }

    pub async fn zrangebyscore_limit(
        &self,
        key: &str,
        min: f64,
        max: f64,
        offset: isize,
        count: isize,
    ) -> RedisResult<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(self.prefixed(key))
            .arg(min)
            .arg(max)
            .arg("LIMIT")
            .arg(offset)
            .arg(count);
        self.execute("ZRANGEBYSCORE", &cmd).await
    }

    pub async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> RedisResult<Vec<(String, f64)>> {
        let mut cmd = redis::cmd("ZRANGE");
        cmd.arg(self.prefixed(key))
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES");
        self.execute("ZRANGE", &cmd).await
    }

    pub async fn zrem(&self, key: &str, member: &str) -> RedisResult<u64> {
        let mut cmd = redis::cmd("ZREM");
        cmd.arg(self.prefixed(key)).arg(member);
        self.execute("ZREM", &cmd).await
    }

    pub async fn zcard(&self, key: &str) -> RedisResult<u64> {
        let mut cmd = redis::cmd("ZCARD");
        cmd.arg(self.prefixed(key));
        self.execute("ZCARD", &cmd).await
    }

    pub async fn zremrangebyrank(&self, key: &str, start: isize, stop: isize) -> RedisResult<u64> {
        let mut cmd = redis::cmd("ZREMRANGEBYRANK");
        cmd.arg(self.prefixed(key)).arg(start).arg(stop);
        self.execute("ZREMRANGEBYRANK", &cmd).await
    }

    pub async fn sadd(&self, key: &str, member: &str) -> RedisResult<u64> {
        let mut cmd = redis::cmd("SADD");
        cmd.arg(self.prefixed(key)).arg(member);
        self.execute("SADD", &cmd).await
    }

    pub async fn srem(&self, key: &str, member: &str) -> RedisResult<u64> {
        let mut cmd = redis::cmd("SREM");
        cmd.arg(self.prefixed(key)).arg(member);
        self.execute("SREM", &cmd).await
    }

    pub async fn smembers(&self, key: &str) -> RedisResult<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(self.prefixed(key));
        self.execute("SMEMBERS", &cmd).await
    }

    pub async fn xadd(&self, key: &str, fields: &[(&str, Vec<u8>)]) -> RedisResult<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.prefixed(key)).arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(value.clone());
        }
        self.execute("XADD", &cmd).await
    }

    /// Creates the consumer group if it does not exist yet; existing groups
    /// are not an error.
    pub async fn xgroup_create_mkstream(&self, key: &str, group: &str) -> RedisResult<()> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE")
            .arg(self.prefixed(key))
            .arg(group)
            .arg("0")
            .arg("MKSTREAM");
        match self.execute::<String>("XGROUP", &cmd).await {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Reads the next unseen entries for the consumer group; never blocks.
    pub async fn xreadgroup(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> RedisResult<Vec<(String, HashMap<String, Vec<u8>>)>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(self.prefixed(key))
            .arg(">");
        let reply: Option<StreamReadReply> = self.execute("XREADGROUP", &cmd).await?;

        let mut entries = Vec::new();
        if let Some(reply) = reply {
            for stream_key in reply.keys {
                for id in stream_key.ids {
                    let mut fields = HashMap::new();
                    for (field, value) in id.map {
                        let bytes: Vec<u8> = redis::from_redis_value(&value)?;
                        fields.insert(field, bytes);
                    }
                    entries.push((id.id, fields));
                }
            }
        }
        Ok(entries)
    }

    pub async fn xack(&self, key: &str, group: &str, id: &str) -> RedisResult<u64> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(self.prefixed(key)).arg(group).arg(id);
        self.execute("XACK", &cmd).await
    }

    pub async fn xlen(&self, key: &str) -> RedisResult<u64> {
        let mut cmd = redis::cmd("XLEN");
        cmd.arg(self.prefixed(key));
        self.execute("XLEN", &cmd).await
    }

    /// EVAL of a server-side script; key operands get the pool's prefix like
    /// every other command.
    pub async fn eval_int(
        &self,
        script: &str,
        keys: &[&str],
        args: &[Vec<u8>],
    ) -> RedisResult<i64> {
        let mut cmd = redis::cmd("EVAL");
        cmd.arg(script).arg(keys.len());
        for key in keys {
            cmd.arg(self.prefixed(key));
        }
        for arg in args {
            cmd.arg(arg.clone());
        }
        self.execute("EVAL", &cmd).await
    }

    pub async fn publish(&self, channel: &str, payload: Vec<u8>) -> RedisResult<u64> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(self.prefixed(channel)).arg(payload);
        self.execute("PUBLISH", &cmd).await
    }

    pub async fn scan_match(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> RedisResult<(u64, Vec<String>)> {
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor)
            .arg("MATCH")
            .arg(self.prefixed(pattern))
            .arg("COUNT")
            .arg(count);
        self.execute("SCAN", &cmd).await
    }
}
