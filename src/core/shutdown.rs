//! 优雅关闭
//!
//! 监听 Ctrl+C / SIGTERM，按注册顺序依次执行清理任务：
//! 某个任务失败或超时只记日志，后面的任务照常执行。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

/// 关闭信号管理器
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；只记录第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert(reason);
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }

    /// 等待关闭信号，返回原因
    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(ShutdownReason::Signal)
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("收到 Ctrl+C，正在关闭服务...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("收到 SIGTERM，正在关闭服务...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    /// 单个清理任务的超时
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    pub fn len(&self) -> usize {
        self.cleanup_tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cleanup_tasks.is_empty()
    }

    /// 执行所有清理任务，返回成功的个数
    pub async fn run_cleanup(&self) -> usize {
        tracing::info!("执行 {} 个清理任务...", self.cleanup_tasks.len());

        let mut succeeded = 0;
        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!(task = name, "清理完成");
                    succeeded += 1;
                }
                Ok(Err(e)) => {
                    tracing::warn!(task = name, error = %e, "清理失败");
                }
                Err(_) => {
                    tracing::warn!(task = name, timeout = ?self.timeout, "清理超时");
                }
            }
        }
        succeeded
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
