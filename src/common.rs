use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use taskmesh_core::{AppConfig, LogFormat, ObservabilityConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app::{AppMode, Application};
use crate::shutdown::ShutdownManager;

/// 通用的应用启动配置
#[derive(Debug, Clone, Default)]
pub struct StartupConfig {
    pub config_path: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub audio_dir: Option<PathBuf>,
    pub max_tasks: Option<u32>,
}

impl StartupConfig {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches.get_one::<String>("config").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            log_format: matches
                .get_one::<String>("log-format")
                .map(|format| match format.as_str() {
                    "json" => LogFormat::Json,
                    _ => LogFormat::Pretty,
                }),
            audio_dir: matches.get_one::<PathBuf>("audio-dir").cloned(),
            max_tasks: matches.get_one::<u32>("max-tasks").copied(),
        }
    }
}

/// 所有二进制共享的命令行参数
pub fn base_command(name: &'static str, about: &'static str) -> Command {
    Command::new(name)
        .version(env!("CARGO_PKG_VERSION"))
        .about(about)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("audio-dir")
                .long("audio-dir")
                .value_name("DIR")
                .help("提交目录中的 mp3 文件作为转写任务，全部完成后退出")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("max-tasks")
                .long("max-tasks")
                .value_name("COUNT")
                .help("Worker最大并发任务数量")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
}

/// 初始化日志系统，`RUST_LOG` 优先于配置的级别
pub fn init_logging(log_level: &str, log_format: LogFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        LogFormat::Pretty => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
    }

    Ok(())
}

/// 按配置启动 Prometheus 指标导出器
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(address) = &config.metrics_bind_address else {
        return Ok(());
    };
    let address: SocketAddr = address
        .parse()
        .with_context(|| format!("无效的指标导出地址: {address}"))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| anyhow::anyhow!("启动Prometheus指标导出器失败: {e}"))?;

    info!("Prometheus指标导出器监听 {}", address);
    Ok(())
}

/// 加载配置并应用命令行覆盖
pub fn load_config(startup_config: &StartupConfig) -> Result<AppConfig> {
    let mut config = AppConfig::load(startup_config.config_path.as_deref())
        .context("加载配置失败")?;

    if let Some(level) = &startup_config.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = startup_config.log_format {
        config.observability.log_format = format;
    }
    if let Some(max_tasks) = startup_config.max_tasks {
        config.worker.max_concurrent_tasks = max_tasks;
    }

    config.validate().context("命令行参数无效")?;
    Ok(config)
}

/// 启动应用程序的通用函数
pub async fn start_application(
    startup_config: StartupConfig,
    app_mode: AppMode,
    service_name: &str,
) -> Result<()> {
    let config = load_config(&startup_config)?;
    init_logging(
        &config.observability.log_level,
        config.observability.log_format,
    )?;
    init_metrics(&config.observability)?;

    info!("启动 {} 服务", service_name);
    if let Some(path) = &startup_config.config_path {
        info!("配置文件: {}", path);
    }
    info!("运行模式: {:?}", app_mode);

    let app = Application::new(config, app_mode)
        .await?
        .with_audio_dir(startup_config.audio_dir);

    let shutdown_manager = ShutdownManager::new();
    let signals = shutdown_manager.listen_for_signals();
    let shutdown_rx = shutdown_manager.subscribe().await;

    let outcome = app.run(shutdown_rx).await;
    signals.abort();

    match outcome {
        Ok(_) => {
            info!("{} 服务已退出", service_name);
            Ok(())
        }
        Err(e) => {
            error!("应用运行失败: {:#}", e);
            Err(e)
        }
    }
}
