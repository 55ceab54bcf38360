use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskmesh_core::{
    keys, NodeId, NodeRegistry, SchedulerError, SchedulerResult, TaskEnvelope, TaskResultRecord,
};

use crate::executors::HandlerRegistry;

/// 执行槽位共享的上下文
pub struct SlotContext {
    pub registry: NodeRegistry,
    pub handlers: Arc<HandlerRegistry>,
    pub node: watch::Receiver<NodeId>,
    /// 任务最多执行的次数（含第一次）
    pub max_task_attempts: u32,
}

impl SlotContext {
    fn current_node(&self) -> NodeId {
        *self.node.borrow()
    }

    /// 执行一个任务负载
    ///
    /// 无论处理器成功、失败还是 panic，槽位标记和任务计数都会被恢复。
    pub async fn run_task(&self, slot: usize, payload: &str) {
        let task = match TaskEnvelope::decode(payload) {
            Ok(task) => task,
            Err(e) => {
                error!("槽位 {} 丢弃无法解析的任务: {}", slot, e);
                metrics::counter!("taskmesh_worker_tasks_dropped_total").increment(1);
                return;
            }
        };

        let node = self.current_node();
        if let Err(e) = self.registry.claim_slot(node, slot, payload).await {
            warn!("写入槽位 {} 标记失败: {}", slot, e);
        }
        if let Err(e) = self.registry.adjust_active_tasks(node, 1).await {
            warn!("增加任务计数失败: {}", e);
        }

        debug!("槽位 {} 开始执行任务 {} ({})", slot, task.index, task.kind.name());
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.handlers.execute(&task))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(SchedulerError::task_execution("任务处理器 panic")));
        let duration = started.elapsed().as_secs_f64();

        if let Err(e) = self.report(slot, &task, outcome, duration).await {
            error!("任务 {} 的结果写回失败: {}", task.index, e);
        }
        self.release(node, slot).await;
    }

    async fn report(
        &self,
        slot: usize,
        task: &TaskEnvelope,
        outcome: SchedulerResult<Value>,
        duration: f64,
    ) -> SchedulerResult<()> {
        let node = self.current_node();
        let store = self.registry.store();

        let result = match outcome {
            Ok(payload) => {
                match self.registry.record_latency(node, duration).await {
                    Ok(average) => info!(
                        "任务 {} 完成，耗时 {:.2}s (平均 {:.2}s)",
                        task.index, duration, average
                    ),
                    Err(e) => warn!(
                        "任务 {} 完成，耗时 {:.2}s，更新耗时统计失败: {}",
                        task.index, duration, e
                    ),
                }
                metrics::counter!("taskmesh_worker_tasks_total", "outcome" => "success")
                    .increment(1);
                TaskResultRecord::success(task.index, payload, duration)
            }
            Err(e) => {
                let retry = task.next_attempt();
                if retry.attempts < self.max_task_attempts {
                    warn!(
                        "任务 {} 第 {} 次执行失败，重新放回全局队列: {}",
                        task.index, retry.attempts, e
                    );
                    store
                        .rpush(keys::UNASSIGNED_TASKS, &retry.encode()?)
                        .await?;
                    metrics::counter!("taskmesh_worker_tasks_total", "outcome" => "requeued")
                        .increment(1);
                    return Ok(());
                }
                error!("任务 {} 在 {} 次尝试后失败: {}", task.index, retry.attempts, e);
                metrics::counter!("taskmesh_worker_tasks_total", "outcome" => "failed")
                    .increment(1);
                TaskResultRecord::failure(task.index, e.to_string(), duration)
            }
        };

        let raw = result.produced_by(node, slot).encode()?;
        store.rpush(&keys::results(node), &raw).await?;
        Ok(())
    }

    async fn release(&self, node: NodeId, slot: usize) {
        // 节点已重新注册时旧记录已被删除，不再写入
        if self.current_node() != node {
            return;
        }
        if let Err(e) = self.registry.adjust_active_tasks(node, -1).await {
            warn!("减少任务计数失败: {}", e);
        }
        if let Err(e) = self.registry.release_slot(node, slot).await {
            warn!("清除槽位 {} 标记失败: {}", slot, e);
        }
    }
}

/// 固定大小的执行池
///
/// N 个槽位从同一个有界通道中取任务。`in_flight` 在交付前由调用方递增，
/// 任务结束后由槽位递减，因此它始终不小于实际执行中的任务数。
pub struct ExecutionPool {
    sender: Option<mpsc::Sender<String>>,
    slots: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
    join_timeout: Duration,
}

impl ExecutionPool {
    pub fn start(context: SlotContext, slot_count: usize, join_timeout: Duration) -> Self {
        let slot_count = slot_count.max(1);
        let (sender, receiver) = mpsc::channel::<String>(slot_count);
        let receiver = Arc::new(Mutex::new(receiver));
        let context = Arc::new(context);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let slots = (0..slot_count)
            .map(|slot| {
                let receiver = Arc::clone(&receiver);
                let context = Arc::clone(&context);
                let in_flight = Arc::clone(&in_flight);
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(payload) = next else {
                            debug!("槽位 {} 退出", slot);
                            break;
                        };
                        context.run_task(slot, &payload).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        info!("执行池启动，{} 个槽位", slot_count);
        Self {
            sender: Some(sender),
            slots,
            in_flight,
            join_timeout,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// 已交付但尚未完成的任务数
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// 交付一个任务负载，调用方应先检查准入
    pub async fn submit(&self, payload: String) -> SchedulerResult<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| SchedulerError::Internal("执行池已关闭".to_string()))?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if sender.send(payload).await.is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(SchedulerError::Internal("执行池已关闭".to_string()));
        }
        Ok(())
    }

    /// 关闭通道并逐个等待槽位结束，返回超时被放弃的槽位数
    pub async fn shutdown(mut self) -> usize {
        self.sender.take();
        let mut abandoned = 0;
        for (slot, handle) in self.slots.drain(..).enumerate() {
            match tokio::time::timeout(self.join_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("槽位 {} 异常退出: {}", slot, e),
                Err(_) => {
                    warn!("槽位 {} 在 {:?} 内未结束，放弃等待", slot, self.join_timeout);
                    abandoned += 1;
                }
            }
        }
        info!("执行池已关闭，放弃 {} 个槽位", abandoned);
        abandoned
    }
}
