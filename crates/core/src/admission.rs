use crate::config::WorkerConfig;
use crate::models::{NodeStatus, ResourceSnapshot};

/// 资源负载区间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBand {
    /// 低于最优阈值，容量可以增长到上限
    Optimal,
    /// 介于两个阈值之间，保持当前容量
    Moderate,
    /// 超过过载阈值，不接受新任务
    Overloaded,
}

/// 节点准入策略
///
/// 双阈值滞回: 过载时只保留1个槽位，处于中间区间时不扩大容量，
/// 低于最优阈值时容量恢复到硬上限。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionPolicy {
    pub max_concurrent_tasks: u32,
    pub overload_threshold: f64,
    pub optimal_threshold: f64,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            overload_threshold: 80.0,
            optimal_threshold: 60.0,
        }
    }
}

impl From<&WorkerConfig> for AdmissionPolicy {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            max_concurrent_tasks: config.max_concurrent_tasks,
            overload_threshold: config.overload_threshold_percent,
            optimal_threshold: config.optimal_threshold_percent,
        }
    }
}

impl AdmissionPolicy {
    pub fn band(&self, resources: &ResourceSnapshot) -> LoadBand {
        if resources.cpu > self.overload_threshold || resources.ram > self.overload_threshold {
            LoadBand::Overloaded
        } else if resources.cpu < self.optimal_threshold && resources.ram < self.optimal_threshold {
            LoadBand::Optimal
        } else {
            LoadBand::Moderate
        }
    }

    pub fn status(&self, resources: &ResourceSnapshot) -> NodeStatus {
        match self.band(resources) {
            LoadBand::Overloaded => NodeStatus::Overloaded,
            _ => NodeStatus::Available,
        }
    }

    /// 计算新的容量上限
    ///
    /// 结果不会低于当前正在执行的任务数，保证 `tasks <= max_tasks` 在写入时成立。
    pub fn capacity(&self, resources: &ResourceSnapshot, previous_cap: u32, in_flight: u32) -> u32 {
        let hard_max = self.max_concurrent_tasks.max(1);
        let base = match self.band(resources) {
            LoadBand::Overloaded => 1,
            LoadBand::Optimal => hard_max,
            LoadBand::Moderate => previous_cap.clamp(1, hard_max),
        };
        base.max(in_flight)
    }

    /// 是否可以再接收一个任务
    pub fn admits(&self, resources: &ResourceSnapshot, cap: u32, in_flight: u32) -> bool {
        self.band(resources) != LoadBand::Overloaded && in_flight < cap
    }
}
