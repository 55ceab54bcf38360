use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("协调存储错误: {0}")]
    Store(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("节点记录格式错误: {0}")]
    MalformedRecord(String),

    #[error("任务负载格式错误: {0}")]
    MalformedTask(String),

    #[error("节点未找到: {id}")]
    NodeNotFound { id: String },

    #[error("没有可用节点: 尝试 {attempts} 次后放弃")]
    NoAvailableNode { attempts: u32 },

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn malformed_task<S: Into<String>>(msg: S) -> Self {
        Self::MalformedTask(msg.into())
    }
    pub fn node_not_found<S: Into<String>>(id: S) -> Self {
        Self::NodeNotFound { id: id.into() }
    }
    pub fn task_execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }

    /// 启动阶段的致命错误，进程应当退出
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Configuration(_) | SchedulerError::Internal(_)
        )
    }

    /// 暂时性错误，下一个调度周期可以重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Store(_)
                | SchedulerError::Timeout(_)
                | SchedulerError::NoAvailableNode { .. }
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
