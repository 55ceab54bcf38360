use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use taskmesh_core::{
    keys, CoordinationStore, DispatcherConfig, ListEnd, NodeId, NodeRegistry, RegistrySnapshot,
    SchedulerError, SchedulerResult, TaskEnvelope, TaskIndex,
};

use crate::strategies::LoadBalancer;

/// 分配重试策略
#[derive(Debug, Clone, Copy)]
pub struct AssignRetryPolicy {
    /// 选择节点的最大尝试次数
    pub max_attempts: u32,
    /// 两次尝试之间的等待时间
    pub backoff: Duration,
}

impl Default for AssignRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

impl From<&DispatcherConfig> for AssignRetryPolicy {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            max_attempts: config.assign_max_attempts.max(1),
            backoff: config.assign_backoff(),
        }
    }
}

/// 一次 `try_drain_unassigned` 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    /// 全局队列为空
    Idle,
    Assigned { index: TaskIndex, node: NodeId },
    /// 没有可用节点，任务已放回全局队列头部
    Requeued { index: TaskIndex },
    /// 负载无法解析，已丢弃
    Dropped,
}

/// 任务分发器
///
/// 拥有全局未分配队列和各节点队列。分配前会从所有节点队列中移除相同负载，
/// 保证同一负载同一时刻最多存在于一个队列中。
pub struct TaskDispatcher {
    store: Arc<dyn CoordinationStore>,
    registry: NodeRegistry,
    balancer: LoadBalancer,
    retry: AssignRetryPolicy,
}

impl TaskDispatcher {
    pub fn new(registry: NodeRegistry, balancer: LoadBalancer, retry: AssignRetryPolicy) -> Self {
        Self {
            store: registry.store().clone(),
            registry,
            balancer,
            retry,
        }
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// 追加任务到全局未分配队列
    pub async fn submit(&self, task: &TaskEnvelope) -> SchedulerResult<()> {
        let payload = task.encode()?;
        self.store.rpush(keys::UNASSIGNED_TASKS, &payload).await?;
        debug!("任务 {} 已提交到全局队列", task.index);
        Ok(())
    }

    /// 将任务分配给负载最低的节点
    ///
    /// 没有可用节点时按重试策略等待后重新选择，全部失败返回 `NoAvailableNode`，
    /// 任务仍由调用方持有。
    pub async fn assign(&self, payload: &str) -> SchedulerResult<NodeId> {
        let max_attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let snapshot = self.registry.read_all().await?;
            let pending = self.pending_counts(&snapshot).await?;

            if let Some(node) = self
                .balancer
                .select_best_node(&snapshot, &pending, Utc::now())
            {
                self.place(node, payload).await?;
                return Ok(node);
            }

            if attempt < max_attempts {
                warn!(
                    "没有可用节点，{:?} 后重试 ({}/{})",
                    self.retry.backoff, attempt, max_attempts
                );
                tokio::time::sleep(self.retry.backoff).await;
            }
        }

        Err(SchedulerError::NoAvailableNode {
            attempts: max_attempts,
        })
    }

    async fn pending_counts(
        &self,
        snapshot: &RegistrySnapshot,
    ) -> SchedulerResult<HashMap<NodeId, usize>> {
        let mut pending = HashMap::new();
        if !self.balancer.strategy().uses_pending_counts() {
            return Ok(pending);
        }
        for record in self.balancer.eligible_nodes(snapshot, Utc::now()) {
            let len = self.store.llen(&keys::task_queue(record.id)).await?;
            pending.insert(record.id, len);
        }
        Ok(pending)
    }

    async fn place(&self, node: NodeId, payload: &str) -> SchedulerResult<()> {
        let queues = self
            .store
            .keys(&keys::pattern(keys::TASK_QUEUE_PREFIX))
            .await?;
        for queue in queues {
            let removed = self.store.lrem(&queue, payload).await?;
            if removed > 0 {
                warn!("从 {} 移除了 {} 个重复任务", queue, removed);
            }
        }

        self.registry.mark_assigned(node, payload).await?;
        self.store.rpush(&keys::task_queue(node), payload).await?;
        metrics::counter!("taskmesh_tasks_assigned_total").increment(1);
        Ok(())
    }

    /// 从全局队列取出一个任务并分配
    ///
    /// 任务先原子地移动到暂存列表，分配成功后才从暂存列表删除；
    /// 分配失败时放回全局队列头部。进程在两步之间崩溃时由 `recover_staged` 恢复。
    pub async fn try_drain_unassigned(&self) -> SchedulerResult<DrainOutcome> {
        let Some(payload) = self
            .store
            .lmove(
                keys::UNASSIGNED_TASKS,
                keys::DISPATCH_STAGING,
                ListEnd::Head,
                ListEnd::Tail,
            )
            .await?
        else {
            return Ok(DrainOutcome::Idle);
        };

        let task = match TaskEnvelope::decode(&payload) {
            Ok(task) => task,
            Err(e) => {
                error!("丢弃无法解析的任务: {}", e);
                self.store.lrem(keys::DISPATCH_STAGING, &payload).await?;
                metrics::counter!("taskmesh_tasks_dropped_total").increment(1);
                return Ok(DrainOutcome::Dropped);
            }
        };

        match self.assign(&payload).await {
            Ok(node) => {
                self.store.lrem(keys::DISPATCH_STAGING, &payload).await?;
                info!("任务 {} ({}) 已分配到 {}", task.index, task.kind.name(), node);
                Ok(DrainOutcome::Assigned {
                    index: task.index,
                    node,
                })
            }
            Err(e) => {
                self.restore_staged().await?;
                if e.is_retryable() {
                    warn!("任务 {} 暂时无法分配，已放回全局队列: {}", task.index, e);
                    Ok(DrainOutcome::Requeued { index: task.index })
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn restore_staged(&self) -> SchedulerResult<usize> {
        let mut restored = 0;
        while self
            .store
            .lmove(
                keys::DISPATCH_STAGING,
                keys::UNASSIGNED_TASKS,
                ListEnd::Tail,
                ListEnd::Head,
            )
            .await?
            .is_some()
        {
            restored += 1;
        }
        Ok(restored)
    }

    /// 启动时把上次崩溃遗留在暂存列表中的任务放回全局队列头部
    pub async fn recover_staged(&self) -> SchedulerResult<usize> {
        let restored = self.restore_staged().await?;
        if restored > 0 {
            warn!("从暂存列表恢复了 {} 个任务", restored);
        }
        Ok(restored)
    }
}
