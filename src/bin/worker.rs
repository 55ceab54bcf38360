use anyhow::Result;
use taskmesh::app::AppMode;
use taskmesh::common::{base_command, start_application, StartupConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = base_command("taskmesh-worker", "分布式任务调度系统 - Worker服务")
        .long_about("启动Worker节点，上报心跳并执行分配到本节点的任务")
        .get_matches();

    start_application(
        StartupConfig::from_matches(&matches),
        AppMode::Worker,
        "Worker",
    )
    .await
}
