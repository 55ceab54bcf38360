//! 进程级关闭信号
//!
//! Dispatcher 和 Worker 通过 `broadcast::Receiver<()>` 感知关闭，
//! 本模块负责把操作系统信号转换为一次广播。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ShutdownManager {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(4);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 获取一个关闭接收器；已经关闭时接收器立即就绪
    pub async fn subscribe(&self) -> broadcast::Receiver<()> {
        let receiver = self.sender.subscribe();
        if self.is_shutdown().await {
            let (late_tx, late_rx) = broadcast::channel(1);
            let _ = late_tx.send(());
            return late_rx;
        }
        receiver
    }

    /// 广播关闭，只有第一次调用生效
    pub async fn shutdown(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            debug!("重复的关闭请求已忽略");
            return;
        }
        match self.sender.send(()) {
            Ok(receivers) => info!("关闭信号已广播给 {} 个组件", receivers),
            Err(_) => debug!("关闭时没有订阅者"),
        }
    }

    pub async fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// 后台等待 SIGINT/SIGTERM 并触发关闭
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            manager.shutdown().await;
        })
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use signal::unix::{signal as unix_signal, SignalKind};

    match unix_signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("无法监听SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

/// 阻塞直到收到 Ctrl+C 或 SIGTERM
pub async fn wait_for_shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("无法监听Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let received = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate_signal() => "SIGTERM",
    };
    info!("收到 {}，开始优雅关闭", received);
}
