use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use taskmesh_core::{
    AppConfig, NodeRegistry, RegistrySnapshot, SchedulerResult, TaskEnvelope, TaskIndex,
    TaskResultRecord,
};

use crate::node_failure_detector::{FailureDetectorConfig, NodeFailureDetector, RecoveryReport};
use crate::result_collector::ResultCollector;
use crate::strategies::{create_strategy, LoadBalancer};
use crate::task_dispatcher::{AssignRetryPolicy, DrainOutcome, TaskDispatcher};

/// 一个调度周期的执行摘要
#[derive(Debug, Default)]
pub struct TickReport {
    pub alive_nodes: usize,
    pub recoveries: Vec<RecoveryReport>,
    pub drain: Option<DrainOutcome>,
    pub new_results: Vec<TaskResultRecord>,
}

/// 调度控制器
///
/// 每个周期依次执行: 状态输出、失效扫描与恢复、分配一个未分配任务、收集结果。
/// 四个步骤共享同一个注册表快照，跨周期不缓存任何状态。
pub struct DispatcherController {
    registry: NodeRegistry,
    dispatcher: TaskDispatcher,
    detector: NodeFailureDetector,
    collector: ResultCollector,
    tick_interval: Duration,
    node_timeout: Duration,
    exit_on_completion: bool,
}

impl DispatcherController {
    pub fn new(registry: NodeRegistry, config: &AppConfig) -> Self {
        let dispatcher_config = &config.dispatcher;
        let node_timeout = dispatcher_config.node_timeout();
        let balancer = LoadBalancer::new(
            create_strategy(dispatcher_config.load_strategy),
            node_timeout,
        );

        Self {
            dispatcher: TaskDispatcher::new(
                registry.clone(),
                balancer,
                AssignRetryPolicy::from(dispatcher_config),
            ),
            detector: NodeFailureDetector::new(
                registry.clone(),
                FailureDetectorConfig::from(dispatcher_config),
            ),
            collector: ResultCollector::new(registry.store().clone(), node_timeout),
            registry,
            tick_interval: dispatcher_config.tick_interval(),
            node_timeout,
            exit_on_completion: false,
        }
    }

    /// 所有登记的任务都有结果后退出循环
    pub fn exit_on_completion(mut self, enabled: bool) -> Self {
        self.exit_on_completion = enabled;
        self
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn collector(&self) -> &ResultCollector {
        &self.collector
    }

    pub fn detector(&self) -> &NodeFailureDetector {
        &self.detector
    }

    /// 提交一批任务，并登记为需要等待结果
    pub async fn submit_batch(&mut self, tasks: &[TaskEnvelope]) -> SchedulerResult<Vec<TaskIndex>> {
        let mut indices = Vec::with_capacity(tasks.len());
        for task in tasks {
            self.dispatcher.submit(task).await?;
            self.collector.expect(task.index);
            indices.push(task.index);
        }
        info!("已提交 {} 个任务", indices.len());
        Ok(indices)
    }

    fn display_status(&self, snapshot: &RegistrySnapshot, now: DateTime<Utc>) -> usize {
        let mut alive = 0;
        for record in snapshot.iter() {
            let is_alive = record.is_alive(now, self.node_timeout);
            if is_alive {
                alive += 1;
            }
            info!(
                node = %record.id,
                cpu = record.resources.cpu,
                ram = record.resources.ram,
                disk = record.resources.disk,
                tasks = record.active_task_count,
                max_tasks = record.max_concurrent_tasks,
                status = record.status.as_str(),
                avg_time = record.avg_time,
                alive = is_alive,
                "节点状态"
            );
        }
        if snapshot.is_empty() {
            debug!("当前没有注册的节点");
        }
        alive
    }

    /// 执行一个调度周期
    pub async fn tick(&mut self, now: DateTime<Utc>) -> SchedulerResult<TickReport> {
        let snapshot = self.registry.read_all().await?;
        let mut report = TickReport {
            alive_nodes: self.display_status(&snapshot, now),
            ..TickReport::default()
        };

        report.recoveries = self.detector.scan_and_recover(&snapshot, now).await?;
        for recovery in &report.recoveries {
            let salvaged = self.collector.ingest_salvaged(&recovery.salvaged_results);
            report.new_results.extend(salvaged);
        }

        report.drain = Some(self.dispatcher.try_drain_unassigned().await?);

        let drained = self.collector.drain_results(&snapshot, now).await?;
        report.new_results.extend(drained);

        Ok(report)
    }

    /// 调度主循环，直到收到关闭信号或（可选）全部任务完成
    pub async fn run(&mut self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        self.dispatcher.recover_staged().await?;
        info!(
            "调度控制器启动，周期 {:?}，负载策略 {}",
            self.tick_interval,
            self.dispatcher.balancer().strategy().name()
        );

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick(Utc::now()).await {
                        Ok(report) => {
                            for result in &report.new_results {
                                debug!("任务 {} 结果: {}", result.index, result.payload);
                            }
                        }
                        Err(e) if e.is_fatal() => {
                            error!("调度周期出现致命错误: {}", e);
                            return Err(e);
                        }
                        Err(e) => warn!("调度周期执行失败，下个周期重试: {}", e),
                    }

                    if self.exit_on_completion && self.collector.is_complete() {
                        info!("全部 {} 个任务已完成", self.collector.expected().len());
                        break;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，调度控制器退出");
                    break;
                }
            }
        }

        Ok(())
    }
}
