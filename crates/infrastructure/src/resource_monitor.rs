use std::path::Path;

use async_trait::async_trait;
use sysinfo::{Disks, System};
use taskmesh_core::{ResourceSnapshot, SchedulerResult};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// 资源采样接口
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// 采集一次 CPU、内存、磁盘使用率（百分比）
    async fn sample(&self) -> SchedulerResult<ResourceSnapshot>;
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// 基于 sysinfo 的本机资源采样器
///
/// CPU 使用率按两次刷新之间的差值计算，首次采样可能为0。
/// 磁盘使用率取根挂载点，找不到时汇总所有磁盘。
pub struct SystemResourceProbe {
    system: Mutex<System>,
    disks: Mutex<Disks>,
}

impl SystemResourceProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }

    fn disk_usage(disks: &Disks) -> f64 {
        if let Some(root) = disks.list().iter().find(|d| d.mount_point() == Path::new("/")) {
            return percent(
                root.total_space().saturating_sub(root.available_space()),
                root.total_space(),
            );
        }
        let (used, total) = disks.list().iter().fold((0u64, 0u64), |(used, total), d| {
            (
                used + d.total_space().saturating_sub(d.available_space()),
                total + d.total_space(),
            )
        });
        percent(used, total)
    }
}

impl Default for SystemResourceProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceProbe for SystemResourceProbe {
    async fn sample(&self) -> SchedulerResult<ResourceSnapshot> {
        let (cpu, ram) = {
            let mut system = self.system.lock().await;
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                f64::from(system.global_cpu_usage()).clamp(0.0, 100.0),
                percent(system.used_memory(), system.total_memory()),
            )
        };
        let disk = {
            let mut disks = self.disks.lock().await;
            disks.refresh(true);
            Self::disk_usage(&disks)
        };
        debug!("资源采样: cpu={:.1}% ram={:.1}% disk={:.1}%", cpu, ram, disk);
        Ok(ResourceSnapshot::new(cpu, ram, disk))
    }
}

/// 返回固定值的采样器，可在运行时修改
#[derive(Debug)]
pub struct StaticResourceProbe {
    snapshot: RwLock<ResourceSnapshot>,
}

impl StaticResourceProbe {
    pub fn new(snapshot: ResourceSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    pub async fn set(&self, snapshot: ResourceSnapshot) {
        *self.snapshot.write().await = snapshot;
    }
}

#[async_trait]
impl ResourceProbe for StaticResourceProbe {
    async fn sample(&self) -> SchedulerResult<ResourceSnapshot> {
        Ok(*self.snapshot.read().await)
    }
}
