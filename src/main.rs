use anyhow::Result;
use clap::Arg;
use taskmesh::app::AppMode;
use taskmesh::common::{base_command, start_application, StartupConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = base_command("taskmesh", "基于共享协调存储的分布式任务调度系统")
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["dispatcher", "worker", "all"])
                .default_value("all"),
        )
        .get_matches();

    let mode: AppMode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("all")
        .parse()?;

    start_application(StartupConfig::from_matches(&matches), mode, "taskmesh").await
}
