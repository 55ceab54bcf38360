use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{info, warn};

use taskmesh_core::{CoordinationStore, SchedulerError, SchedulerResult, TaskEnvelope, TaskKind};

use crate::game::{ScenarioHandler, SnakeMoveHandler};

/// 任务处理器
///
/// 每种任务类型对应一个处理器，返回值作为结果负载写回结果列表。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// 处理的任务类型，与 `TaskKind::name` 一致
    fn kind(&self) -> &'static str;

    async fn execute(&self, task: &TaskEnvelope) -> SchedulerResult<Value>;
}

/// 按任务类型查找处理器
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册转写、移动和场景三种内置处理器
    pub fn with_defaults(store: Arc<dyn CoordinationStore>, transcription_command: &str) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TranscriptionHandler::new(transcription_command)));
        registry.register(Arc::new(SnakeMoveHandler::new(store.clone())));
        registry.register(Arc::new(ScenarioHandler::new(store)));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        info!("注册任务处理器: {}", handler.kind());
        if self.handlers.insert(handler.kind(), handler).is_some() {
            warn!("任务处理器被覆盖");
        }
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    pub async fn execute(&self, task: &TaskEnvelope) -> SchedulerResult<Value> {
        let kind = task.kind.name();
        let handler = self.get(kind).ok_or_else(|| {
            SchedulerError::task_execution(format!("不支持的任务类型: {kind}"))
        })?;
        handler.execute(task).await
    }
}

/// 音频转写处理器
///
/// 以音频路径为最后一个参数调用外部命令，标准输出作为转写文本。
pub struct TranscriptionHandler {
    program: String,
    args: Vec<String>,
}

impl TranscriptionHandler {
    /// `command` 按空白拆分，第一段是程序名
    pub fn new(command: &str) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        Self {
            program: parts.next().unwrap_or_default(),
            args: parts.collect(),
        }
    }
}

#[async_trait]
impl TaskHandler for TranscriptionHandler {
    fn kind(&self) -> &'static str {
        "transcription"
    }

    async fn execute(&self, task: &TaskEnvelope) -> SchedulerResult<Value> {
        let TaskKind::Transcription { path } = &task.kind else {
            return Err(SchedulerError::task_execution(format!(
                "{} 不是转写任务",
                task.kind.name()
            )));
        };
        if self.program.is_empty() {
            return Err(SchedulerError::config_error("未配置转写命令"));
        }

        info!("转写音频 {}: {}", task.index, path);
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                SchedulerError::task_execution(format!("启动转写命令 {} 失败: {e}", self.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SchedulerError::task_execution(format!(
                "转写命令执行失败，退出码 {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(json!({ "path": path, "text": text }))
    }
}
