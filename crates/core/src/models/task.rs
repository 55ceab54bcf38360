use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

/// 应用定义的任务标识，用于结果去重
pub type TaskIndex = u64;

/// 贪吃蛇移动方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

/// 场景更新动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioAction {
    AddFood,
    AddObstacle,
}

/// 已知的任务类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// 音频转写
    Transcription { path: String },
    /// 玩家移动一步
    SnakeMove {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_id: Option<String>,
        direction: Direction,
    },
    /// 场景变更（放置食物或障碍物）
    ScenarioUpdate {
        action: ScenarioAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<[i32; 2]>,
    },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Transcription { .. } => "transcription",
            TaskKind::SnakeMove { .. } => "snake_move",
            TaskKind::ScenarioUpdate { .. } => "scenario_update",
        }
    }
}

/// 队列中传递的任务负载
///
/// 只在队列边界解码一次；调度器内部把编码后的字符串当作任务身份使用。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub index: TaskIndex,
    #[serde(default)]
    pub attempts: u32,
    #[serde(flatten)]
    pub kind: TaskKind,
}

impl TaskEnvelope {
    pub fn new(index: TaskIndex, kind: TaskKind) -> Self {
        Self {
            index,
            attempts: 0,
            kind,
        }
    }

    pub fn transcription(index: TaskIndex, path: impl Into<String>) -> Self {
        Self::new(index, TaskKind::Transcription { path: path.into() })
    }

    pub fn encode(&self) -> SchedulerResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> SchedulerResult<Self> {
        serde_json::from_str(raw).map_err(|e| SchedulerError::MalformedTask(format!("{e}: {raw}")))
    }

    /// 下一次尝试使用的负载
    pub fn next_attempt(&self) -> Self {
        Self {
            attempts: self.attempts + 1,
            ..self.clone()
        }
    }
}
