use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use taskmesh_core::{LoadStrategyKind, NodeId, NodeRecord, RegistrySnapshot};

/// 参与评分的候选节点
#[derive(Debug, Clone, Copy)]
pub struct NodeLoad<'a> {
    pub record: &'a NodeRecord,
    /// 节点任务队列中尚未被拉取的任务数
    pub pending_tasks: usize,
}

/// 负载评分策略，分数越低越优先
pub trait LoadBalancingStrategy: Send + Sync {
    fn load_score(&self, node: &NodeLoad<'_>) -> f64;

    fn name(&self) -> &str;

    /// 是否需要读取各节点队列长度
    fn uses_pending_counts(&self) -> bool {
        false
    }
}

/// `0.7 * ((cpu + ram) / 2) + 0.3 * (active / max * 100)`
pub struct WeightedLoadStrategy;

impl WeightedLoadStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WeightedLoadStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingStrategy for WeightedLoadStrategy {
    fn load_score(&self, node: &NodeLoad<'_>) -> f64 {
        let record = node.record;
        let resource_load = (record.resources.cpu + record.resources.ram) / 2.0;
        let slot_load = if record.max_concurrent_tasks == 0 {
            100.0
        } else {
            record.active_task_count as f64 / record.max_concurrent_tasks as f64 * 100.0
        };
        0.7 * resource_load + 0.3 * slot_load
    }

    fn name(&self) -> &str {
        "Weighted"
    }
}

/// `(cpu + ram) / 2 + pending * 15`
pub struct PendingPenaltyStrategy;

impl PendingPenaltyStrategy {
    pub const PENALTY_PER_TASK: f64 = 15.0;

    pub fn new() -> Self {
        Self
    }
}

impl Default for PendingPenaltyStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingStrategy for PendingPenaltyStrategy {
    fn load_score(&self, node: &NodeLoad<'_>) -> f64 {
        let record = node.record;
        (record.resources.cpu + record.resources.ram) / 2.0
            + node.pending_tasks as f64 * Self::PENALTY_PER_TASK
    }

    fn name(&self) -> &str {
        "PendingPenalty"
    }

    fn uses_pending_counts(&self) -> bool {
        true
    }
}

pub fn create_strategy(kind: LoadStrategyKind) -> Arc<dyn LoadBalancingStrategy> {
    match kind {
        LoadStrategyKind::Weighted => Arc::new(WeightedLoadStrategy::new()),
        LoadStrategyKind::PendingPenalty => Arc::new(PendingPenaltyStrategy::new()),
    }
}

/// 负载均衡器
///
/// 只在存活、未过载且仍有空闲槽位的节点中选择。候选节点按ID升序枚举，
/// 分数相同时取第一个，同一快照总是得到同一结果。
#[derive(Clone)]
pub struct LoadBalancer {
    strategy: Arc<dyn LoadBalancingStrategy>,
    node_timeout: Duration,
}

impl LoadBalancer {
    pub fn new(strategy: Arc<dyn LoadBalancingStrategy>, node_timeout: Duration) -> Self {
        Self {
            strategy,
            node_timeout,
        }
    }

    pub fn strategy(&self) -> &Arc<dyn LoadBalancingStrategy> {
        &self.strategy
    }

    pub fn node_timeout(&self) -> Duration {
        self.node_timeout
    }

    pub fn eligible_nodes<'a>(
        &self,
        snapshot: &'a RegistrySnapshot,
        now: DateTime<Utc>,
    ) -> Vec<&'a NodeRecord> {
        snapshot
            .alive(now, self.node_timeout)
            .filter(|record| !record.is_overloaded() && record.has_capacity())
            .collect()
    }

    /// 选择负载最低的节点，没有候选节点时返回 None
    pub fn select_best_node(
        &self,
        snapshot: &RegistrySnapshot,
        pending: &HashMap<NodeId, usize>,
        now: DateTime<Utc>,
    ) -> Option<NodeId> {
        let candidates = self.eligible_nodes(snapshot, now);
        if candidates.is_empty() {
            debug!("没有可用的节点");
            return None;
        }

        let selected = candidates
            .into_iter()
            .map(|record| {
                let load = NodeLoad {
                    record,
                    pending_tasks: pending.get(&record.id).copied().unwrap_or(0),
                };
                (record.id, self.strategy.load_score(&load))
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;

        debug!(
            "{}策略选择节点: {} (负载评分: {:.1})",
            self.strategy.name(),
            selected.0,
            selected.1
        );
        Some(selected.0)
    }
}

#[cfg(test)]
#[path = "strategies_test.rs"]
mod strategies_test;
