use anyhow::Result;
use taskmesh::app::AppMode;
use taskmesh::common::{base_command, start_application, StartupConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = base_command("taskmesh-dispatcher", "分布式任务调度系统 - Dispatcher服务")
        .long_about("启动调度控制器，负责节点失效恢复、任务分配和结果收集")
        .get_matches();

    start_application(
        StartupConfig::from_matches(&matches),
        AppMode::Dispatcher,
        "Dispatcher",
    )
    .await
}
