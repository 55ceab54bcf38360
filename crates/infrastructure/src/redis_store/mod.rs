//! Redis 协调存储实现

pub mod connection_manager;

pub use connection_manager::RedisConnectionManager;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use taskmesh_core::{CoordinationStore, ListEnd, SchedulerError, SchedulerResult, StoreConfig};
use tracing::{debug, error};

const SCAN_BATCH_SIZE: usize = 100;

const HSET_IF_EXISTS_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
";

pub struct RedisCoordinationStore {
    connection_manager: Arc<RedisConnectionManager>,
    hset_if_exists: redis::Script,
}

impl RedisCoordinationStore {
    pub async fn new(config: StoreConfig) -> SchedulerResult<Self> {
        let connection_manager = Arc::new(RedisConnectionManager::new(config).await?);
        Ok(Self {
            connection_manager,
            hset_if_exists: redis::Script::new(HSET_IF_EXISTS_SCRIPT),
        })
    }

    pub fn connection_manager(&self) -> &Arc<RedisConnectionManager> {
        &self.connection_manager
    }

    fn conn(&self) -> ConnectionManager {
        self.connection_manager.connection()
    }

    async fn query<T: redis::FromRedisValue>(
        &self,
        op: &'static str,
        cmd: &redis::Cmd,
    ) -> SchedulerResult<T> {
        let mut conn = self.conn();
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| store_error(op, e))
    }
}

fn store_error(op: &'static str, err: redis::RedisError) -> SchedulerError {
    error!("Redis {} failed: {}", op, err);
    metrics::counter!("taskmesh_store_errors_total", "op" => op).increment(1);
    SchedulerError::store(format!("{op}: {err}"))
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn hget(&self, key: &str, field: &str) -> SchedulerResult<Option<String>> {
        self.query("HGET", redis::cmd("HGET").arg(key).arg(field))
            .await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> SchedulerResult<()> {
        let _: i64 = self
            .query("HSET", redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await?;
        Ok(())
    }

    async fn hset_multiple(&self, key: &str, items: &[(String, String)]) -> SchedulerResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in items {
            cmd.arg(field).arg(value);
        }
        let _: i64 = self.query("HSET", &cmd).await?;
        Ok(())
    }

    async fn hset_multiple_if_exists(
        &self,
        key: &str,
        items: &[(String, String)],
    ) -> SchedulerResult<bool> {
        if items.is_empty() {
            return self.exists(key).await;
        }
        let mut invocation = self.hset_if_exists.key(key);
        for (field, value) in items {
            invocation.arg(field).arg(value);
        }
        let mut conn = self.conn();
        let written: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("EVALSHA", e))?;
        Ok(written == 1)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> SchedulerResult<i64> {
        self.query("HINCRBY", redis::cmd("HINCRBY").arg(key).arg(field).arg(delta))
            .await
    }

    async fn hdel(&self, key: &str, field: &str) -> SchedulerResult<()> {
        let _: i64 = self
            .query("HDEL", redis::cmd("HDEL").arg(key).arg(field))
            .await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> SchedulerResult<HashMap<String, String>> {
        self.query("HGETALL", redis::cmd("HGETALL").arg(key)).await
    }

    async fn exists(&self, key: &str) -> SchedulerResult<bool> {
        let count: i64 = self.query("EXISTS", redis::cmd("EXISTS").arg(key)).await?;
        Ok(count > 0)
    }

    async fn del(&self, key: &str) -> SchedulerResult<()> {
        let _: i64 = self.query("DEL", redis::cmd("DEL").arg(key)).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> SchedulerResult<usize> {
        self.query("RPUSH", redis::cmd("RPUSH").arg(key).arg(value))
            .await
    }

    async fn lpush(&self, key: &str, value: &str) -> SchedulerResult<usize> {
        self.query("LPUSH", redis::cmd("LPUSH").arg(key).arg(value))
            .await
    }

    async fn lpop(&self, key: &str) -> SchedulerResult<Option<String>> {
        self.query("LPOP", redis::cmd("LPOP").arg(key)).await
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> SchedulerResult<Option<String>> {
        // BLPOP 的超时为0表示永久阻塞
        if timeout.is_zero() {
            return self.lpop(key).await;
        }

        let mut cmd = redis::cmd("BLPOP");
        cmd.arg(key).arg(timeout.as_secs_f64());
        let popped: Option<(String, String)> = self
            .connection_manager
            .blocking_query(&cmd)
            .await
            .inspect_err(|_| {
                metrics::counter!("taskmesh_store_errors_total", "op" => "BLPOP").increment(1);
            })?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn lrange_all(&self, key: &str) -> SchedulerResult<Vec<String>> {
        self.query("LRANGE", redis::cmd("LRANGE").arg(key).arg(0).arg(-1))
            .await
    }

    async fn lrem(&self, key: &str, value: &str) -> SchedulerResult<usize> {
        self.query("LREM", redis::cmd("LREM").arg(key).arg(0).arg(value))
            .await
    }

    async fn lmove(
        &self,
        src: &str,
        dst: &str,
        from: ListEnd,
        to: ListEnd,
    ) -> SchedulerResult<Option<String>> {
        self.query(
            "LMOVE",
            redis::cmd("LMOVE")
                .arg(src)
                .arg(dst)
                .arg(from.as_str())
                .arg(to.as_str()),
        )
        .await
    }

    async fn llen(&self, key: &str) -> SchedulerResult<usize> {
        self.query("LLEN", redis::cmd("LLEN").arg(key)).await
    }

    async fn incr(&self, key: &str) -> SchedulerResult<i64> {
        self.query("INCR", redis::cmd("INCR").arg(key)).await
    }

    async fn get(&self, key: &str) -> SchedulerResult<Option<String>> {
        self.query("GET", redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> SchedulerResult<()> {
        let _: () = self
            .query("SET", redis::cmd("SET").arg(key).arg(value))
            .await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> SchedulerResult<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = self
                .query(
                    "SCAN",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH_SIZE),
                )
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        // SCAN 可能返回重复的键
        keys.sort();
        keys.dedup();
        debug!("SCAN {} matched {} keys", pattern, keys.len());
        Ok(keys)
    }
}
