use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 负载评分公式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategyKind {
    /// `0.7 * 资源均值 + 0.3 * 槽位占用率`
    #[default]
    Weighted,
    /// `资源均值 + 待处理任务数 * 15`
    PendingPenalty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub tick_interval_ms: u64,
    pub node_timeout_seconds: u64,
    pub assign_max_attempts: u32,
    pub assign_backoff_ms: u64,
    pub load_strategy: LoadStrategyKind,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            node_timeout_seconds: 5,
            assign_max_attempts: 3,
            assign_backoff_ms: 2000,
            load_strategy: LoadStrategyKind::Weighted,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(anyhow::anyhow!("调度间隔必须大于0"));
        }

        if self.node_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("节点超时时间必须大于0"));
        }

        if self.assign_max_attempts == 0 {
            return Err(anyhow::anyhow!("分配重试次数必须大于0"));
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_seconds)
    }

    pub fn assign_backoff(&self) -> Duration {
        Duration::from_millis(self.assign_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 为空时使用本机主机名
    pub hostname: Option<String>,
    pub max_concurrent_tasks: u32,
    pub overload_threshold_percent: f64,
    pub optimal_threshold_percent: f64,
    pub heartbeat_interval_ms: u64,
    pub pop_timeout_ms: u64,
    pub join_timeout_seconds: u64,
    pub max_task_attempts: u32,
    pub transcription_command: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            max_concurrent_tasks: 5,
            overload_threshold_percent: 80.0,
            optimal_threshold_percent: 60.0,
            heartbeat_interval_ms: 1000,
            pop_timeout_ms: 1000,
            join_timeout_seconds: 5,
            max_task_attempts: 3,
            transcription_command: "whisper".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(anyhow::anyhow!("最大并发任务数必须大于0"));
        }

        let percent = 0.0..=100.0;
        if !percent.contains(&self.overload_threshold_percent)
            || !percent.contains(&self.optimal_threshold_percent)
        {
            return Err(anyhow::anyhow!("资源阈值必须在0到100之间"));
        }

        if self.optimal_threshold_percent > self.overload_threshold_percent {
            return Err(anyhow::anyhow!(
                "最优阈值 {} 不能高于过载阈值 {}",
                self.optimal_threshold_percent,
                self.overload_threshold_percent
            ));
        }

        if self.heartbeat_interval_ms == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.pop_timeout_ms == 0 {
            return Err(anyhow::anyhow!("任务拉取超时必须大于0"));
        }

        if self.max_task_attempts == 0 {
            return Err(anyhow::anyhow!("任务最大尝试次数必须大于0"));
        }

        if self.transcription_command.trim().is_empty() {
            return Err(anyhow::anyhow!("转写命令不能为空"));
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_seconds)
    }
}
