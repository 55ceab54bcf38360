//! 节点注册表
//!
//! 所有节点记录都保存在协调存储中，这里只是对键布局和字段语义的封装。
//! `tasks` 字段只通过原子增减修改，心跳从不覆盖它。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::admission::AdmissionPolicy;
use crate::keys::{self, fields};
use crate::models::{
    to_epoch_seconds, NodeId, NodeRecord, NodeStatus, RegistrySnapshot, ResourceSnapshot,
};
use crate::traits::CoordinationStore;
use crate::{SchedulerError, SchedulerResult};

/// 一次心跳写入后的节点状态
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatOutcome {
    pub status: NodeStatus,
    pub max_concurrent_tasks: u32,
}

#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<dyn CoordinationStore>,
    policy: AdmissionPolicy,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            policy: AdmissionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: AdmissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// 分配新的节点ID并写入悲观初始值
    ///
    /// 初始记录没有 `last_heartbeat`，节点在第一次心跳之前不会被判定为存活。
    pub async fn register(&self, hostname: &str) -> SchedulerResult<NodeId> {
        self.register_at(hostname, Utc::now()).await
    }

    pub async fn register_at(&self, hostname: &str, now: DateTime<Utc>) -> SchedulerResult<NodeId> {
        let counter = self.store.incr(keys::NODE_COUNTER).await?;
        let id = NodeId(counter.max(0) as u64);
        let seed = ResourceSnapshot::fully_loaded();

        let record = vec![
            (fields::CPU.to_string(), seed.cpu.to_string()),
            (fields::RAM.to_string(), seed.ram.to_string()),
            (fields::DISK.to_string(), seed.disk.to_string()),
            (fields::STATUS.to_string(), NodeStatus::Available.as_str().to_string()),
            (fields::TASKS.to_string(), "0".to_string()),
            (fields::MAX_TASKS.to_string(), "1".to_string()),
            (fields::AVG_TIME.to_string(), "0".to_string()),
            (fields::LAST_TIME.to_string(), "0".to_string()),
            (fields::REGISTERED_AT.to_string(), to_epoch_seconds(now).to_string()),
            (fields::HOSTNAME.to_string(), hostname.to_string()),
        ];
        self.store
            .hset_multiple(&keys::node_stats(id), &record)
            .await?;

        debug!("节点注册完成: {} ({})", id, hostname);
        Ok(id)
    }

    /// 写入一次心跳，重新计算状态和容量上限
    ///
    /// 节点记录已被删除时返回 `NodeNotFound`，调用方应以新ID重新注册。
    pub async fn update_heartbeat(
        &self,
        id: NodeId,
        resources: &ResourceSnapshot,
        in_flight: u32,
    ) -> SchedulerResult<HeartbeatOutcome> {
        self.update_heartbeat_at(id, resources, in_flight, Utc::now())
            .await
    }

    pub async fn update_heartbeat_at(
        &self,
        id: NodeId,
        resources: &ResourceSnapshot,
        in_flight: u32,
        now: DateTime<Utc>,
    ) -> SchedulerResult<HeartbeatOutcome> {
        let key = keys::node_stats(id);
        let previous_cap = self
            .store
            .hget(&key, fields::MAX_TASKS)
            .await?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1);

        let status = self.policy.status(resources);
        let max_concurrent_tasks = self.policy.capacity(resources, previous_cap, in_flight);

        let update = vec![
            (fields::CPU.to_string(), resources.cpu.to_string()),
            (fields::RAM.to_string(), resources.ram.to_string()),
            (fields::DISK.to_string(), resources.disk.to_string()),
            (fields::STATUS.to_string(), status.as_str().to_string()),
            (fields::MAX_TASKS.to_string(), max_concurrent_tasks.to_string()),
            (fields::LAST_HEARTBEAT.to_string(), to_epoch_seconds(now).to_string()),
        ];
        // 记录被回收后不能再被心跳重新创建
        if !self.store.hset_multiple_if_exists(&key, &update).await? {
            return Err(SchedulerError::node_not_found(id.to_string()));
        }

        Ok(HeartbeatOutcome {
            status,
            max_concurrent_tasks,
        })
    }

    /// 读取所有节点记录
    pub async fn read_all(&self) -> SchedulerResult<RegistrySnapshot> {
        let keys = self
            .store
            .keys(&keys::pattern(keys::NODE_STATS_PREFIX))
            .await?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(id) = keys::node_id_from_key(&key, keys::NODE_STATS_PREFIX) else {
                warn!("忽略无法识别的节点键: {}", key);
                continue;
            };
            let raw = self.store.hgetall(&key).await?;
            if raw.is_empty() {
                continue;
            }
            records.push(NodeRecord::from_fields(id, &raw));
        }

        Ok(RegistrySnapshot::new(records))
    }

    pub async fn read(&self, id: NodeId) -> SchedulerResult<Option<NodeRecord>> {
        let raw = self.store.hgetall(&keys::node_stats(id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(NodeRecord::from_fields(id, &raw)))
    }

    /// 节点是否存活，记录不存在视为不存活
    pub async fn check_node_status(
        &self,
        id: NodeId,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> SchedulerResult<bool> {
        Ok(self
            .read(id)
            .await?
            .map(|record| record.is_alive(now, timeout))
            .unwrap_or(false))
    }

    /// 删除结果列表、任务队列和节点记录
    ///
    /// 节点记录最后删除，中途失败时记录仍在，失效检测会再次回收。
    pub async fn remove(&self, id: NodeId) -> SchedulerResult<()> {
        self.store.del(&keys::results(id)).await?;
        self.store.del(&keys::task_queue(id)).await?;
        self.store.del(&keys::node_stats(id)).await?;
        debug!("节点记录已删除: {}", id);
        Ok(())
    }

    /// 原子调整正在执行的任务数，结果不会小于0
    pub async fn adjust_active_tasks(&self, id: NodeId, delta: i64) -> SchedulerResult<u32> {
        let key = keys::node_stats(id);
        let value = self.store.hincr_by(&key, fields::TASKS, delta).await?;
        if value < 0 {
            warn!("节点 {} 的任务计数为负 ({})，重置为0", id, value);
            self.store.hset(&key, fields::TASKS, "0").await?;
            return Ok(0);
        }
        Ok(value as u32)
    }

    /// 记录 Dispatcher 的分配标记
    pub async fn mark_assigned(&self, id: NodeId, payload: &str) -> SchedulerResult<()> {
        self.store
            .hset(&keys::node_stats(id), fields::CURRENT_TASK, payload)
            .await
    }

    /// 执行槽位接手任务: 写入槽位标记，并清除匹配的分配标记
    pub async fn claim_slot(&self, id: NodeId, slot: usize, payload: &str) -> SchedulerResult<()> {
        let key = keys::node_stats(id);
        self.store
            .hset(&key, &fields::slot_marker(slot), payload)
            .await?;
        if self.store.hget(&key, fields::CURRENT_TASK).await?.as_deref() == Some(payload) {
            self.store.hdel(&key, fields::CURRENT_TASK).await?;
        }
        Ok(())
    }

    pub async fn release_slot(&self, id: NodeId, slot: usize) -> SchedulerResult<()> {
        self.store
            .hdel(&keys::node_stats(id), &fields::slot_marker(slot))
            .await
    }

    /// 更新执行耗时统计，平均值为指数平均 `(avg + d) / 2`
    pub async fn record_latency(&self, id: NodeId, duration: f64) -> SchedulerResult<f64> {
        let key = keys::node_stats(id);
        let previous = self
            .store
            .hget(&key, fields::AVG_TIME)
            .await?
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);

        let average = if previous <= 0.0 {
            duration
        } else {
            (previous + duration) / 2.0
        };

        self.store
            .hset_multiple(
                &key,
                &[
                    (fields::AVG_TIME.to_string(), average.to_string()),
                    (fields::LAST_TIME.to_string(), duration.to_string()),
                ],
            )
            .await?;
        Ok(average)
    }
}
