use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use taskmesh_core::{
    keys, CoordinationStore, RegistrySnapshot, SchedulerResult, TaskIndex, TaskResultRecord,
};

/// 结果收集器
///
/// 按任务索引去重，先到者胜出。已收集的结果不会被撤销。
pub struct ResultCollector {
    store: Arc<dyn CoordinationStore>,
    node_timeout: Duration,
    expected: BTreeSet<TaskIndex>,
    collected: BTreeMap<TaskIndex, TaskResultRecord>,
}

impl ResultCollector {
    pub fn new(store: Arc<dyn CoordinationStore>, node_timeout: Duration) -> Self {
        Self {
            store,
            node_timeout,
            expected: BTreeSet::new(),
            collected: BTreeMap::new(),
        }
    }

    /// 登记一个需要等待结果的任务
    pub fn expect(&mut self, index: TaskIndex) {
        self.expected.insert(index);
    }

    pub fn expected(&self) -> &BTreeSet<TaskIndex> {
        &self.expected
    }

    pub fn collected(&self) -> &BTreeMap<TaskIndex, TaskResultRecord> {
        &self.collected
    }

    pub fn len(&self) -> usize {
        self.collected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collected.is_empty()
    }

    /// 所有登记的任务都已有结果
    pub fn is_complete(&self) -> bool {
        !self.expected.is_empty()
            && self
                .expected
                .iter()
                .all(|index| self.collected.contains_key(index))
    }

    /// 取出所有存活节点的结果，返回本次新接受的结果
    pub async fn drain_results(
        &mut self,
        snapshot: &RegistrySnapshot,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<TaskResultRecord>> {
        let mut accepted = Vec::new();
        let alive: Vec<_> = snapshot
            .alive(now, self.node_timeout)
            .map(|record| record.id)
            .collect();

        for node in alive {
            let key = keys::results(node);
            while let Some(raw) = self.store.lpop(&key).await? {
                if let Some(result) = self.ingest(&raw) {
                    accepted.push(result);
                }
            }
        }

        Ok(accepted)
    }

    /// 接收失联节点抢救出的结果
    pub fn ingest_salvaged(&mut self, raw_results: &[String]) -> Vec<TaskResultRecord> {
        raw_results
            .iter()
            .filter_map(|raw| self.ingest(raw))
            .collect()
    }

    /// 记录一条原始结果，重复或无法解析时返回 None
    pub fn ingest(&mut self, raw: &str) -> Option<TaskResultRecord> {
        let result = match TaskResultRecord::decode(raw) {
            Ok(result) => result,
            Err(e) => {
                warn!("丢弃无法解析的结果: {}", e);
                return None;
            }
        };

        if self.collected.contains_key(&result.index) {
            debug!("任务 {} 的重复结果已丢弃", result.index);
            return None;
        }

        match &result.error {
            None => info!(
                "收到任务 {} 的结果 (耗时 {:.2}s)",
                result.index, result.duration
            ),
            Some(error) => warn!("任务 {} 最终失败: {}", result.index, error),
        }
        metrics::counter!("taskmesh_results_collected_total").increment(1);
        self.collected.insert(result.index, result.clone());
        Some(result)
    }
}
