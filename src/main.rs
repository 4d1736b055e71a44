//! mcp-chat 服务入口
//!
//! 初始化日志 → 加载配置 → 打开设置 → 启动 MCP 进程池 → 打开对话存储 → 服务 HTTP / WebSocket。
//! Ctrl+C / SIGTERM 触发优雅关闭：停止接收连接后依次执行清理任务。
//!
//! 运行方式：
//! ```bash
//! cargo run -- [config.toml]
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mcp_chat::agent::AgentFactory;
use mcp_chat::config::load_config;
use mcp_chat::conversation::create_conversation_repository;
use mcp_chat::core::{
    McpPoolCleanup, RepositoryCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use mcp_chat::gateway::{serve, AppState, ChatServices};
use mcp_chat::mcp::{McpPoolManager, StdioLauncher};
use mcp_chat::observability;
use mcp_chat::settings::SettingsStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;

    let settings = Arc::new(SettingsStore::open(&cfg.storage.settings_path));
    let initial = settings.load().await.context("Failed to load settings")?;
    observability::init(initial.debug_mode);
    tracing::info!(
        "Settings loaded from {:?} (provider: {}, model: {}, {} MCP server(s))",
        cfg.storage.settings_path,
        initial.llm_provider.provider,
        initial.llm_provider.model,
        initial.mcp_servers.len()
    );

    let launcher = Arc::new(StdioLauncher::new(
        Duration::from_secs(cfg.mcp.init_timeout_secs),
        Duration::from_secs(cfg.mcp.tool_timeout_secs),
    ));
    let pool = McpPoolManager::new(settings.clone(), launcher);
    pool.initialize().await.context("Failed to initialize MCP servers")?;

    let repository = create_conversation_repository(cfg.storage.database_path.as_deref()).await;
    let agents = Arc::new(
        AgentFactory::new(Duration::from_secs(cfg.agent.request_timeout_secs))
            .with_max_steps(cfg.agent.max_steps),
    );

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(10));
    coordinator.register(McpPoolCleanup::new(pool.clone()));
    coordinator.register(RepositoryCleanup::new(repository.clone()));

    let state = AppState::new(ChatServices {
        repository,
        agents,
        pool,
        settings,
    });

    if let Err(e) = serve(state, &cfg.server.bind_addr, shutdown.token()).await {
        tracing::error!("Server error: {:#}", e);
        shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
    }

    let failed = coordinator.run_cleanup().await;
    tracing::info!(
        "Shutdown complete (reason: {:?}, failed cleanups: {})",
        shutdown.reason(),
        failed
    );
    Ok(())
}
