use std::sync::Arc;

use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use taskmesh_core::{
    keys, AdmissionPolicy, LoadBand, NodeId, NodeRegistry, SchedulerResult, WorkerConfig,
};
use taskmesh_infrastructure::ResourceProbe;

use crate::components::{ExecutionPool, HeartbeatManager, SlotContext};
use crate::executors::HandlerRegistry;

/// 控制循环单步的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlStep {
    /// 资源过载，本轮不取任务
    Overloaded,
    /// 执行中的任务数已达到容量上限
    AtCapacity,
    /// 等待超时，队列中没有任务
    Idle,
    /// 任务已交给执行池
    Dispatched,
    /// 取出任务后发现资源过载，任务已放回节点队列
    Returned,
}

impl ControlStep {
    fn should_pause(&self) -> bool {
        matches!(
            self,
            ControlStep::Overloaded | ControlStep::AtCapacity | ControlStep::Returned
        )
    }
}

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    registry: NodeRegistry,
    probe: Arc<dyn ResourceProbe>,
    config: WorkerConfig,
    handlers: Option<HandlerRegistry>,
    hostname: Option<String>,
}

impl WorkerServiceBuilder {
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// 替换默认的任务处理器
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// 注册节点并构建服务
    pub async fn build(self) -> SchedulerResult<WorkerService> {
        let registry = self
            .registry
            .with_policy(AdmissionPolicy::from(&self.config));
        let handlers = self.handlers.unwrap_or_else(|| {
            HandlerRegistry::with_defaults(
                registry.store().clone(),
                &self.config.transcription_command,
            )
        });
        let hostname = self
            .hostname
            .or_else(|| self.config.hostname.clone())
            .unwrap_or_else(local_hostname);

        let heartbeat = HeartbeatManager::register(registry, self.probe, hostname).await?;
        Ok(WorkerService {
            heartbeat,
            handlers: Arc::new(handlers),
            config: self.config,
        })
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Worker服务
///
/// 控制循环: 心跳 -> 准入判断 -> 限时阻塞取任务 -> 交给执行池。
pub struct WorkerService {
    heartbeat: HeartbeatManager,
    handlers: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl WorkerService {
    pub fn builder(registry: NodeRegistry, probe: Arc<dyn ResourceProbe>) -> WorkerServiceBuilder {
        WorkerServiceBuilder {
            registry,
            probe,
            config: WorkerConfig::default(),
            handlers: None,
            hostname: None,
        }
    }

    pub fn node(&self) -> NodeId {
        self.heartbeat.node()
    }

    pub fn registry(&self) -> &NodeRegistry {
        self.heartbeat.registry()
    }

    /// 创建与本节点绑定的执行池
    pub fn start_pool(&self) -> ExecutionPool {
        let context = SlotContext {
            registry: self.registry().clone(),
            handlers: Arc::clone(&self.handlers),
            node: self.heartbeat.subscribe(),
            max_task_attempts: self.config.max_task_attempts.max(1),
        };
        ExecutionPool::start(
            context,
            self.config.max_concurrent_tasks.max(1) as usize,
            self.config.join_timeout(),
        )
    }

    /// 执行一次控制循环
    pub async fn step(&self, pool: &ExecutionPool) -> SchedulerResult<ControlStep> {
        let in_flight = pool.in_flight() as u32;
        let heartbeat = self.heartbeat.beat(in_flight).await?;
        let policy = self.registry().policy();

        if policy.band(&heartbeat.resources) == LoadBand::Overloaded {
            debug!(
                "节点 {} 过载 (cpu {:.1}%, ram {:.1}%)，暂停取任务",
                heartbeat.node, heartbeat.resources.cpu, heartbeat.resources.ram
            );
            return Ok(ControlStep::Overloaded);
        }
        if !policy.admits(
            &heartbeat.resources,
            heartbeat.outcome.max_concurrent_tasks,
            in_flight,
        ) {
            return Ok(ControlStep::AtCapacity);
        }

        let store = self.registry().store();
        let queue = keys::task_queue(heartbeat.node);
        let Some(payload) = store.blpop(&queue, self.config.pop_timeout()).await? else {
            return Ok(ControlStep::Idle);
        };

        let resources = match self.heartbeat.sample().await {
            Ok(resources) => resources,
            Err(e) => {
                warn!("资源采样失败，沿用心跳时的采样: {}", e);
                heartbeat.resources
            }
        };
        if policy.band(&resources) == LoadBand::Overloaded {
            warn!("资源过高，任务放回节点 {} 的队列", heartbeat.node);
            store.rpush(&queue, &payload).await?;
            return Ok(ControlStep::Returned);
        }

        if let Err(e) = pool.submit(payload.clone()).await {
            store.rpush(&queue, &payload).await?;
            return Err(e);
        }
        Ok(ControlStep::Dispatched)
    }

    /// 运行控制循环直到收到关闭信号，然后关闭执行池
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        let pool = self.start_pool();
        info!(
            "节点 {} 开始监听，最多 {} 个并发任务",
            self.node(),
            pool.slot_count()
        );

        loop {
            match shutdown_rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => break,
            }

            let pause = match self.step(&pool).await {
                Ok(step) => step.should_pause(),
                Err(e) => {
                    warn!("控制循环出错: {}", e);
                    true
                }
            };

            if pause {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.heartbeat_interval()) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
        }

        info!("节点 {} 停止接收任务，等待执行中的任务结束", self.node());
        pool.shutdown().await;
        Ok(())
    }
}
