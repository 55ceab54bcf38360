use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use taskmesh_core::{
    HeartbeatOutcome, NodeId, NodeRegistry, ResourceSnapshot, SchedulerError, SchedulerResult,
};
use taskmesh_infrastructure::ResourceProbe;

/// 一次心跳的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Heartbeat {
    pub node: NodeId,
    pub resources: ResourceSnapshot,
    pub outcome: HeartbeatOutcome,
}

/// 心跳管理
///
/// 负责注册节点、周期性写入资源采样。节点记录被 Dispatcher 回收后，
/// 以新的ID重新注册，并通过 watch 通道通知执行槽位。
pub struct HeartbeatManager {
    registry: NodeRegistry,
    probe: Arc<dyn ResourceProbe>,
    hostname: String,
    node_tx: watch::Sender<NodeId>,
}

impl HeartbeatManager {
    /// 注册节点并返回管理器
    pub async fn register(
        registry: NodeRegistry,
        probe: Arc<dyn ResourceProbe>,
        hostname: String,
    ) -> SchedulerResult<Self> {
        let node = registry.register(&hostname).await?;
        info!("节点注册为 {} ({})", node, hostname);
        let (node_tx, _) = watch::channel(node);
        Ok(Self {
            registry,
            probe,
            hostname,
            node_tx,
        })
    }

    pub fn node(&self) -> NodeId {
        *self.node_tx.borrow()
    }

    /// 订阅节点ID的变化
    pub fn subscribe(&self) -> watch::Receiver<NodeId> {
        self.node_tx.subscribe()
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// 采样一次资源
    pub async fn sample(&self) -> SchedulerResult<ResourceSnapshot> {
        self.probe.sample().await
    }

    /// 采样资源并写入心跳
    pub async fn beat(&self, in_flight: u32) -> SchedulerResult<Heartbeat> {
        let resources = self.sample().await?;
        let node = self.node();

        let outcome = match self
            .registry
            .update_heartbeat(node, &resources, in_flight)
            .await
        {
            Ok(outcome) => outcome,
            Err(SchedulerError::NodeNotFound { .. }) => {
                let fresh = self.registry.register(&self.hostname).await?;
                warn!("节点 {} 的记录已被回收，重新注册为 {}", node, fresh);
                self.node_tx.send_replace(fresh);
                metrics::counter!("taskmesh_worker_reregistrations_total").increment(1);
                self.registry
                    .update_heartbeat(fresh, &resources, in_flight)
                    .await?
            }
            Err(e) => return Err(e),
        };

        metrics::gauge!("taskmesh_worker_cpu_percent").set(resources.cpu);
        metrics::gauge!("taskmesh_worker_ram_percent").set(resources.ram);
        Ok(Heartbeat {
            node: self.node(),
            resources,
            outcome,
        })
    }
}
