use serde::{Deserialize, Serialize};

use super::{NodeId, TaskIndex};
use crate::{SchedulerError, SchedulerResult};

/// 节点推送到结果列表中的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultRecord {
    pub index: TaskIndex,
    pub payload: serde_json::Value,
    /// 执行耗时（秒）
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<usize>,
    /// 所有尝试都失败时携带最后一次的错误信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResultRecord {
    pub fn success(index: TaskIndex, payload: serde_json::Value, duration: f64) -> Self {
        Self {
            index,
            payload,
            duration,
            node: None,
            slot: None,
            error: None,
        }
    }

    pub fn failure(index: TaskIndex, error: impl Into<String>, duration: f64) -> Self {
        Self {
            index,
            payload: serde_json::Value::Null,
            duration,
            node: None,
            slot: None,
            error: Some(error.into()),
        }
    }

    pub fn produced_by(mut self, node: NodeId, slot: usize) -> Self {
        self.node = Some(node);
        self.slot = Some(slot);
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn encode(&self) -> SchedulerResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> SchedulerResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SchedulerError::Serialization(format!("无效的结果负载: {e}")))
    }
}
