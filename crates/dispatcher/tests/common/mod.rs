#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskmesh_core::{
    AdmissionPolicy, CoordinationStore, ListEnd, NodeId, NodeRegistry, ResourceSnapshot,
    SchedulerError, SchedulerResult, TaskEnvelope,
};
use taskmesh_dispatcher::{
    AssignRetryPolicy, LoadBalancer, TaskDispatcher, WeightedLoadStrategy,
};
use taskmesh_infrastructure::InMemoryCoordinationStore;

pub const NODE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn store() -> Arc<dyn CoordinationStore> {
    Arc::new(InMemoryCoordinationStore::new())
}

pub fn registry_with_cap(store: Arc<dyn CoordinationStore>, max_concurrent_tasks: u32) -> NodeRegistry {
    NodeRegistry::new(store).with_policy(AdmissionPolicy {
        max_concurrent_tasks,
        ..AdmissionPolicy::default()
    })
}

pub fn dispatcher(registry: &NodeRegistry) -> TaskDispatcher {
    TaskDispatcher::new(
        registry.clone(),
        LoadBalancer::new(Arc::new(WeightedLoadStrategy::new()), NODE_TIMEOUT),
        AssignRetryPolicy {
            max_attempts: 2,
            backoff: Duration::from_millis(10),
        },
    )
}

/// 注册节点并以指定时间发送一次心跳
pub async fn live_node_at(
    registry: &NodeRegistry,
    cpu: f64,
    ram: f64,
    at: DateTime<Utc>,
) -> NodeId {
    let id = registry.register_at("test-host", at).await.unwrap();
    registry
        .update_heartbeat_at(id, &ResourceSnapshot::new(cpu, ram, 10.0), 0, at)
        .await
        .unwrap();
    id
}

pub async fn live_node(registry: &NodeRegistry, cpu: f64, ram: f64) -> NodeId {
    live_node_at(registry, cpu, ram, Utc::now()).await
}

pub fn task(index: u64) -> TaskEnvelope {
    TaskEnvelope::transcription(index, format!("audios/{index}.mp3"))
}

pub fn payload(index: u64) -> String {
    task(index).encode().unwrap()
}

/// 可以注入一次性故障的存储，其余操作交给内存实现
pub struct FaultyStore {
    inner: InMemoryCoordinationStore,
    /// (操作名, 键前缀)，命中一次后移除
    failures: StdMutex<Vec<(&'static str, String)>>,
    /// 读取该键的 max_tasks 字段后立即删除该键，模拟并发回收
    delete_after_read: StdMutex<Option<String>>,
}

impl FaultyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryCoordinationStore::new(),
            failures: StdMutex::new(Vec::new()),
            delete_after_read: StdMutex::new(None),
        })
    }

    pub fn fail_next(&self, op: &'static str, key_prefix: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((op, key_prefix.to_string()));
    }

    pub fn delete_after_read(&self, key: &str) {
        *self.delete_after_read.lock().unwrap() = Some(key.to_string());
    }

    fn check(&self, op: &'static str, key: &str) -> SchedulerResult<()> {
        let mut failures = self.failures.lock().unwrap();
        if let Some(pos) = failures
            .iter()
            .position(|(name, prefix)| *name == op && key.starts_with(prefix.as_str()))
        {
            failures.remove(pos);
            return Err(SchedulerError::store(format!("injected {op} failure on {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for FaultyStore {
    async fn hget(&self, key: &str, field: &str) -> SchedulerResult<Option<String>> {
        self.check("hget", key)?;
        let value = self.inner.hget(key, field).await?;
        let doomed = {
            let mut target = self.delete_after_read.lock().unwrap();
            if target.as_deref() == Some(key) && field == "max_tasks" {
                target.take()
            } else {
                None
            }
        };
        if doomed.is_some() {
            self.inner.del(key).await?;
        }
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> SchedulerResult<()> {
        self.check("hset", key)?;
        self.inner.hset(key, field, value).await
    }

    async fn hset_multiple(&self, key: &str, items: &[(String, String)]) -> SchedulerResult<()> {
        self.check("hset_multiple", key)?;
        self.inner.hset_multiple(key, items).await
    }

    async fn hset_multiple_if_exists(
        &self,
        key: &str,
        items: &[(String, String)],
    ) -> SchedulerResult<bool> {
        self.check("hset_multiple_if_exists", key)?;
        self.inner.hset_multiple_if_exists(key, items).await
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> SchedulerResult<i64> {
        self.check("hincr_by", key)?;
        self.inner.hincr_by(key, field, delta).await
    }

    async fn hdel(&self, key: &str, field: &str) -> SchedulerResult<()> {
        self.check("hdel", key)?;
        self.inner.hdel(key, field).await
    }

    async fn hgetall(&self, key: &str) -> SchedulerResult<HashMap<String, String>> {
        self.check("hgetall", key)?;
        self.inner.hgetall(key).await
    }

    async fn exists(&self, key: &str) -> SchedulerResult<bool> {
        self.check("exists", key)?;
        self.inner.exists(key).await
    }

    async fn del(&self, key: &str) -> SchedulerResult<()> {
        self.check("del", key)?;
        self.inner.del(key).await
    }

    async fn rpush(&self, key: &str, value: &str) -> SchedulerResult<usize> {
        self.check("rpush", key)?;
        self.inner.rpush(key, value).await
    }

    async fn lpush(&self, key: &str, value: &str) -> SchedulerResult<usize> {
        self.check("lpush", key)?;
        self.inner.lpush(key, value).await
    }

    async fn lpop(&self, key: &str) -> SchedulerResult<Option<String>> {
        self.check("lpop", key)?;
        self.inner.lpop(key).await
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> SchedulerResult<Option<String>> {
        self.check("blpop", key)?;
        self.inner.blpop(key, timeout).await
    }

    async fn lrange_all(&self, key: &str) -> SchedulerResult<Vec<String>> {
        self.check("lrange_all", key)?;
        self.inner.lrange_all(key).await
    }

    async fn lrem(&self, key: &str, value: &str) -> SchedulerResult<usize> {
        self.check("lrem", key)?;
        self.inner.lrem(key, value).await
    }

    async fn lmove(
        &self,
        src: &str,
        dst: &str,
        from: ListEnd,
        to: ListEnd,
    ) -> SchedulerResult<Option<String>> {
        self.check("lmove", src)?;
        self.inner.lmove(src, dst, from, to).await
    }

    async fn llen(&self, key: &str) -> SchedulerResult<usize> {
        self.check("llen", key)?;
        self.inner.llen(key).await
    }

    async fn incr(&self, key: &str) -> SchedulerResult<i64> {
        self.check("incr", key)?;
        self.inner.incr(key).await
    }

    async fn get(&self, key: &str) -> SchedulerResult<Option<String>> {
        self.check("get", key)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> SchedulerResult<()> {
        self.check("set", key)?;
        self.inner.set(key, value).await
    }

    async fn keys(&self, pattern: &str) -> SchedulerResult<Vec<String>> {
        self.check("keys", pattern)?;
        self.inner.keys(pattern).await
    }
}
