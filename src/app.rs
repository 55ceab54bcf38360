use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use taskmesh_core::{AppConfig, CoordinationStore, NodeRegistry, StoreType, TaskResultRecord};
use taskmesh_dispatcher::DispatcherController;
use taskmesh_infrastructure::{ResourceProbe, StoreFactory, SystemResourceProbe};
use taskmesh_worker::WorkerService;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::batch;

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行Dispatcher
    Dispatcher,
    /// 仅运行Worker
    Worker,
    /// 在同一进程中运行两者
    All,
}

impl std::str::FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(mode: &str) -> Result<Self> {
        match mode {
            "dispatcher" => Ok(AppMode::Dispatcher),
            "worker" => Ok(AppMode::Worker),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {mode}")),
        }
    }
}

/// 主应用程序
#[derive(Clone)]
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    store: Arc<dyn CoordinationStore>,
    probe: Arc<dyn ResourceProbe>,
    audio_dir: Option<PathBuf>,
}

impl Application {
    /// 连接协调存储并创建应用实例
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);
        if config.store.r#type == StoreType::InMemory && mode != AppMode::All {
            warn!("内存存储只在进程内共享，{:?} 模式下无法与其他进程协作", mode);
        }

        let store = StoreFactory::create(&config.store)
            .await
            .context("连接协调存储失败")?;
        Ok(Self::with_store(config, mode, store))
    }

    pub fn with_store(config: AppConfig, mode: AppMode, store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            config,
            mode,
            store,
            probe: Arc::new(SystemResourceProbe::new()),
            audio_dir: None,
        }
    }

    /// 替换 Worker 使用的资源采样器
    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// 启动时提交目录中的音频，全部完成后退出
    pub fn with_audio_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.audio_dir = dir;
        self
    }

    pub fn mode(&self) -> AppMode {
        self.mode
    }

    /// 运行应用程序，返回 Dispatcher 收集到的结果
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<Vec<TaskResultRecord>> {
        info!("启动应用程序，模式: {:?}", self.mode);
        match self.mode {
            AppMode::Dispatcher => self.run_dispatcher(shutdown_rx).await,
            AppMode::Worker => {
                self.run_worker(shutdown_rx).await?;
                Ok(Vec::new())
            }
            AppMode::All => self.run_all_components(shutdown_rx).await,
        }
    }

    fn registry(&self) -> NodeRegistry {
        NodeRegistry::new(Arc::clone(&self.store))
    }

    async fn run_dispatcher(
        &self,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Vec<TaskResultRecord>> {
        info!("启动Dispatcher服务");
        let mut controller = DispatcherController::new(self.registry(), &self.config)
            .exit_on_completion(self.audio_dir.is_some());

        if let Some(dir) = &self.audio_dir {
            let tasks = batch::transcription_tasks(dir)?;
            if tasks.is_empty() {
                warn!("目录 {} 中没有 mp3 文件", dir.display());
                return Ok(Vec::new());
            }
            controller
                .submit_batch(&tasks)
                .await
                .context("提交转写任务失败")?;
        }

        controller.run(shutdown_rx).await?;

        let results: Vec<TaskResultRecord> =
            controller.collector().collected().values().cloned().collect();
        if self.audio_dir.is_some() {
            log_transcriptions(&results);
        }
        info!("Dispatcher服务已停止，共收集 {} 个结果", results.len());
        Ok(results)
    }

    async fn run_worker(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let service = WorkerService::builder(self.registry(), Arc::clone(&self.probe))
            .config(self.config.worker.clone())
            .build()
            .await
            .context("Worker注册失败")?;
        info!("启动Worker服务: {}", service.node());

        service.run(shutdown_rx).await?;
        info!("Worker服务已停止");
        Ok(())
    }

    /// 同时运行 Dispatcher 和 Worker，Dispatcher 退出后停止 Worker
    async fn run_all_components(
        &self,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Vec<TaskResultRecord>> {
        info!("启动所有组件");
        let (worker_stop_tx, worker_stop_rx) = broadcast::channel(1);

        let worker = {
            let app = self.clone();
            tokio::spawn(async move {
                if let Err(e) = app.run_worker(worker_stop_rx).await {
                    error!("Worker运行失败: {}", e);
                }
            })
        };

        let results = self.run_dispatcher(shutdown_rx).await;
        let _ = worker_stop_tx.send(());
        if let Err(e) = worker.await {
            error!("Worker任务异常退出: {}", e);
        }

        info!("所有组件已停止");
        results
    }
}

fn log_transcriptions(results: &[TaskResultRecord]) {
    for result in results {
        match &result.error {
            None => info!(
                index = result.index,
                duration = result.duration,
                "转写结果: {}",
                result.payload.get("text").unwrap_or(&result.payload)
            ),
            Some(error) => warn!(index = result.index, "转写失败: {}", error),
        }
    }
}

