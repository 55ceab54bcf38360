use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use taskmesh_core::{
    keys, CoordinationStore, DispatcherConfig, NodeId, NodeRecord, NodeRegistry,
    RegistrySnapshot, SchedulerResult,
};

/// 节点失效检测配置
#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    /// 心跳超时时间
    pub node_timeout: Duration,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(5), // 5秒心跳超时
        }
    }
}

impl From<&DispatcherConfig> for FailureDetectorConfig {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            node_timeout: config.node_timeout(),
        }
    }
}

/// 一个失联节点的恢复结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub node: Option<NodeId>,
    /// 放回全局队列的任务负载
    pub requeued: Vec<String>,
    /// 因重复而跳过的负载数
    pub skipped_duplicates: usize,
    /// 从结果列表中抢救出的原始结果
    pub salvaged_results: Vec<String>,
    /// 节点数据是否已全部删除；为 false 时下个周期会再次回收
    pub retired: bool,
}

/// 节点失效检测与恢复
///
/// 状态机: 未知 -> 活跃 -> 失联。失联节点的待处理任务和执行中标记
/// 被放回全局队列，随后删除节点的全部数据，节点ID不再复用。
pub struct NodeFailureDetector {
    store: Arc<dyn CoordinationStore>,
    registry: NodeRegistry,
    config: FailureDetectorConfig,
    active_nodes: BTreeSet<NodeId>,
}

impl NodeFailureDetector {
    pub fn new(registry: NodeRegistry, config: FailureDetectorConfig) -> Self {
        Self {
            store: registry.store().clone(),
            registry,
            config,
            active_nodes: BTreeSet::new(),
        }
    }

    /// 当前被认为活跃的节点
    pub fn active_nodes(&self) -> &BTreeSet<NodeId> {
        &self.active_nodes
    }

    /// 扫描快照，恢复所有失联节点
    pub async fn scan_and_recover(
        &mut self,
        snapshot: &RegistrySnapshot,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<RecoveryReport>> {
        let timeout = self.config.node_timeout;
        let mut reports = Vec::new();

        for record in snapshot.iter() {
            if record.is_alive(now, timeout) {
                if self.active_nodes.insert(record.id) {
                    info!("节点 {} 已上线", record.id);
                }
                continue;
            }

            if !record.is_stale(now, timeout) {
                debug!("节点 {} 尚未发送心跳", record.id);
                continue;
            }

            if self.active_nodes.remove(&record.id) {
                warn!("节点 {} 已断开连接", record.id);
            } else {
                warn!("清理从未上线的失联节点 {}", record.id);
            }

            // 单个节点失败不影响其他节点的回收报告
            match self.recover_node(record).await {
                Ok(report) => reports.push(report),
                Err(e) => error!("恢复节点 {} 的任务失败，下个周期重试: {}", record.id, e),
            }
        }

        let vanished: Vec<NodeId> = self
            .active_nodes
            .iter()
            .filter(|id| snapshot.get(**id).is_none())
            .copied()
            .collect();
        for id in vanished {
            warn!("节点 {} 的记录已消失", id);
            self.active_nodes.remove(&id);
        }

        metrics::gauge!("taskmesh_nodes_alive").set(self.active_nodes.len() as f64);
        Ok(reports)
    }

    async fn recover_node(&self, record: &NodeRecord) -> SchedulerResult<RecoveryReport> {
        let node = record.id;
        let pending = self.store.lrange_all(&keys::task_queue(node)).await?;
        let in_flight = record.in_flight_markers();
        let global: HashSet<String> = self
            .store
            .lrange_all(keys::UNASSIGNED_TASKS)
            .await?
            .into_iter()
            .collect();

        let mut report = RecoveryReport {
            node: Some(node),
            ..RecoveryReport::default()
        };
        let mut seen = HashSet::new();
        for payload in pending.into_iter().chain(in_flight) {
            if global.contains(&payload) || !seen.insert(payload.clone()) {
                report.skipped_duplicates += 1;
                continue;
            }
            self.store.rpush(keys::UNASSIGNED_TASKS, &payload).await?;
            report.requeued.push(payload);
        }
        metrics::counter!("taskmesh_tasks_requeued_total").increment(report.requeued.len() as u64);

        // 只读取不弹出，删除失败时结果仍留在存储中
        report.salvaged_results = self.store.lrange_all(&keys::results(node)).await?;

        match self.registry.remove(node).await {
            Ok(()) => report.retired = true,
            Err(e) => {
                warn!("删除节点 {} 的数据失败，下个周期重试: {}", node, e);
                return Ok(report);
            }
        }

        metrics::counter!("taskmesh_nodes_disconnected_total").increment(1);
        info!(
            "节点 {} 已回收: 重新入队 {} 个任务，跳过 {} 个重复，抢救 {} 个结果",
            node,
            report.requeued.len(),
            report.skipped_duplicates,
            report.salvaged_results.len()
        );
        Ok(report)
    }
}
