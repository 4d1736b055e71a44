//! 会话监管：后台任务跟踪、中断管理
//!
//! 每个 WebSocket 会话持有一个 SessionSupervisor。每条 chat / edit 动作作为一个后台任务
//! 运行，拿到根 token 的子 token；stop_stream 取消当前所有任务，会话关闭时 `shutdown`
//! 取消并等待全部任务结束（任务 panic 只记日志，不向上传播）。

use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TrackedTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// 会话级生命周期管理：取消令牌与后台任务集合
#[derive(Default)]
pub struct SessionSupervisor {
    /// 会话关闭时触发
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<TrackedTask>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建子 token（用于单个任务）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 启动一个被跟踪的后台任务；先清理已结束的任务，避免集合无限增长
    pub fn spawn<F, Fut>(&self, name: &'static str, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.child_token();
        let fut = f(token.clone());
        let handle = tokio::spawn(fut);

        let mut tasks = self.lock_tasks();
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(TrackedTask { token, handle });
        tracing::debug!(task = name, active = tasks.len(), "Background task spawned");
    }

    /// 取消当前所有任务（stop_stream），会话本身仍可继续接收新任务
    pub fn cancel_all(&self) -> usize {
        let tasks = self.lock_tasks();
        let mut cancelled = 0;
        for task in tasks.iter().filter(|t| !t.handle.is_finished()) {
            task.token.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// 会话关闭：取消所有任务并等待其结束，错误被吞掉
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let tasks: Vec<TrackedTask> = std::mem::take(&mut *self.lock_tasks());
        for task in tasks {
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    tracing::warn!("Background task ended with error: {}", e);
                }
            }
        }
    }

    /// 仍在运行的任务数
    pub fn active_count(&self) -> usize {
        self.lock_tasks().iter().filter(|t| !t.handle.is_finished()).count()
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<TrackedTask>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
