//! 优雅关闭处理
//!
//! 信号（Ctrl+C / SIGTERM）或服务异常触发关闭 token，HTTP 服务停止接收连接；
//! 随后按注册顺序执行清理任务：
//! - MCP 服务子进程被终止并回收
//! - SQLite 连接池正确关闭

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::conversation::ConversationRepository;
use crate::mcp::McpPoolManager;

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM 信号
    Signal,
    /// 服务异常退出
    FatalError(String),
}

/// 关闭信号管理器：一个进程级 token，记录第一次触发的原因
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 传给 `serve` 的关闭 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发只保留第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            if slot.is_none() {
                tracing::info!("Shutdown requested: {:?}", reason);
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    /// 触发关闭的原因；服务自行退出时为 None
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        manager.shutdown(ShutdownReason::Signal);
                    }
                    Err(e) => tracing::warn!("SIGTERM handler not installed: {}", e),
                }
            });
        }
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理任务，每个任务单独超时
pub struct ShutdownCoordinator {
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            timeout,
        }
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Box::new(task));
    }

    /// 执行所有清理任务，返回失败或超时的任务数
    pub async fn run_cleanup(&self) -> usize {
        let mut failed = 0;
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!("Cleanup '{}' done", name),
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::warn!("Cleanup '{}' failed: {:#}", name, e);
                }
                Err(_) => {
                    failed += 1;
                    tracing::warn!("Cleanup '{}' timed out after {:?}", name, self.timeout);
                }
            }
        }
        failed
    }
}

/// MCP 进程池清理：取消配置订阅并停止所有服务进程
pub struct McpPoolCleanup {
    pool: Arc<McpPoolManager>,
}

impl McpPoolCleanup {
    pub fn new(pool: Arc<McpPoolManager>) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for McpPoolCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.pool.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mcp-pool"
    }
}

/// 对话存储清理（SQLite 连接池关闭）
pub struct RepositoryCleanup {
    repository: Arc<dyn ConversationRepository>,
}

impl RepositoryCleanup {
    pub fn new(repository: Arc<dyn ConversationRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for RepositoryCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.repository.close().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "conversation-repository"
    }
}
