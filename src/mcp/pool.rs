//! MCP 服务进程池
//!
//! 进程级共享的一组服务进程，所有 Agent 执行从这里拿到当前启用的服务。
//! - 服务组（ServerGroup）是统一的释放点：整组启动、整组停止
//! - 单个服务启动失败只记日志并跳过；配置非法是致命错误
//! - settings 中 mcp_servers 变化时整组替换；新组启动失败则恢复旧组，恢复也失败时报告致命错误
//! - 禁用只影响之后的执行能看到哪些服务，不停进程

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::{Mutex, RwLock};

use super::errors::McpError;
use super::server::{ServerLauncher, ToolServer};
use super::types::ServerState;
use crate::settings::{
    validate_server, McpServerConfig, SettingsChangeEvent, SettingsObserver, SettingsStore,
    SubscriptionId,
};

const MCP_SERVERS_KEY: &str = "mcp_servers";

/// 一次配置对应的一组服务进程
#[derive(Default)]
struct ServerGroup {
    configs: BTreeMap<String, McpServerConfig>,
    servers: BTreeMap<String, Arc<dyn ToolServer>>,
}

impl ServerGroup {
    /// 启动整组：先校验全部配置（非法即失败），再并发启动，单个失败跳过；
    /// 配置非空但一个都没起来时返回错误
    async fn start(
        launcher: &dyn ServerLauncher,
        configs: &BTreeMap<String, McpServerConfig>,
    ) -> Result<Self, McpError> {
        let problems: Vec<String> = configs
            .iter()
            .flat_map(|(name, config)| validate_server(name, config))
            .collect();
        if !problems.is_empty() {
            return Err(McpError::ConfigError(problems.join("; ")));
        }

        let launches = configs.iter().map(|(name, config)| async move {
            (name.clone(), launcher.launch(name, config).await)
        });

        let mut servers = BTreeMap::new();
        let mut failures = Vec::new();
        for (name, result) in join_all(launches).await {
            match result {
                Ok(server) => {
                    servers.insert(name, server);
                }
                Err(e) => {
                    tracing::warn!(server = %name, "Failed to start MCP server, skipping: {}", e);
                    failures.push(e.to_string());
                }
            }
        }

        tracing::info!("Started {}/{} MCP servers", servers.len(), configs.len());

        if servers.is_empty() && !configs.is_empty() {
            return Err(McpError::InitFailed {
                server: configs.keys().cloned().collect::<Vec<_>>().join(","),
                reason: failures.join("; "),
            });
        }

        Ok(Self {
            configs: configs.clone(),
            servers,
        })
    }

    /// 只记录配置、没有运行进程的组
    fn stopped(configs: BTreeMap<String, McpServerConfig>) -> Self {
        Self {
            configs,
            servers: BTreeMap::new(),
        }
    }

    async fn stop(self) {
        let count = self.servers.len();
        join_all(self.servers.values().map(|s| s.shutdown())).await;
        if count > 0 {
            tracing::info!("Stopped {} MCP servers", count);
        }
    }
}

#[derive(Default)]
struct PoolState {
    group: ServerGroup,
    disabled: HashSet<String>,
}

/// MCP 服务进程池管理器（显式构造，通过 Arc 注入使用方）
pub struct McpPoolManager {
    settings: Arc<SettingsStore>,
    launcher: Arc<dyn ServerLauncher>,
    state: RwLock<PoolState>,
    init_lock: Mutex<()>,
    initialized: AtomicBool,
    subscription: std::sync::Mutex<Option<SubscriptionId>>,
}

impl McpPoolManager {
    pub fn new(settings: Arc<SettingsStore>, launcher: Arc<dyn ServerLauncher>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            launcher,
            state: RwLock::new(PoolState::default()),
            init_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
            subscription: std::sync::Mutex::new(None),
        })
    }

    /// 初始化：只执行一次（并发首次调用时双重检查）。配置非法时返回错误；
    /// 服务全部启动失败不致命，进程池以无服务状态继续
    pub async fn initialize(self: &Arc<Self>) -> Result<(), McpError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let settings = self
            .settings
            .load()
            .await
            .map_err(|e| McpError::ConfigError(e.to_string()))?;

        let group = match ServerGroup::start(self.launcher.as_ref(), &settings.mcp_servers).await {
            Ok(group) => group,
            Err(e @ McpError::ConfigError(_)) => return Err(e),
            Err(e) => {
                tracing::error!("No MCP server could be started: {}", e);
                ServerGroup::stopped(settings.mcp_servers.clone())
            }
        };
        self.state.write().await.group = group;

        let observer = Arc::new(PoolObserver {
            pool: Arc::downgrade(self),
        });
        let id = self.settings.subscribe(observer);
        if let Ok(mut subscription) = self.subscription.lock() {
            *subscription = Some(id);
        }

        self.initialized.store(true, Ordering::Release);
        tracing::info!("MCP pool initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// 当前运行且未被禁用的服务；新的 Agent 执行只拿到这些
    pub async fn get_enabled_servers(&self) -> Vec<Arc<dyn ToolServer>> {
        let state = self.state.read().await;
        state
            .group
            .servers
            .iter()
            .filter(|(name, _)| !state.disabled.contains(*name))
            .map(|(_, server)| Arc::clone(server))
            .collect()
    }

    /// 启用 / 禁用服务；未配置的名字返回 false 且不改变任何状态
    pub async fn toggle_server(&self, name: &str, enabled: bool) -> bool {
        let mut state = self.state.write().await;
        if !state.group.configs.contains_key(name) {
            tracing::warn!("Cannot toggle unknown MCP server '{}'", name);
            return false;
        }
        if enabled {
            state.disabled.remove(name);
        } else {
            state.disabled.insert(name.to_string());
        }
        tracing::info!("MCP server '{}' {}", name, if enabled { "enabled" } else { "disabled" });
        true
    }

    /// 每个已配置服务的状态
    pub async fn get_server_states(&self) -> BTreeMap<String, ServerState> {
        let state = self.state.read().await;
        let mut states = BTreeMap::new();
        for name in state.group.configs.keys() {
            let enabled = !state.disabled.contains(name);
            let alive = match state.group.servers.get(name) {
                Some(server) => server.is_running().await,
                None => false,
            };
            states.insert(
                name.clone(),
                ServerState {
                    configured: true,
                    enabled,
                    running: alive && enabled,
                },
            );
        }
        states
    }

    /// 每个运行中服务的进程是否存活
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        let state = self.state.read().await;
        let mut health = BTreeMap::new();
        for (name, server) in &state.group.servers {
            health.insert(name.clone(), server.is_running().await);
        }
        health
    }

    /// 按当前 settings 重启全部服务
    pub async fn restart_servers(&self) -> Result<(), McpError> {
        let settings = self
            .settings
            .load()
            .await
            .map_err(|e| McpError::ConfigError(e.to_string()))?;
        self.replace_group(&settings.mcp_servers).await
    }

    /// 整组替换。持有写锁直到新组就绪，之后开始的执行只会拿到新服务
    async fn replace_group(&self, configs: &BTreeMap<String, McpServerConfig>) -> Result<(), McpError> {
        let mut state = self.state.write().await;
        let previous = std::mem::take(&mut state.group);
        let previous_configs = previous.configs.clone();
        previous.stop().await;

        let reason = match ServerGroup::start(self.launcher.as_ref(), configs).await {
            Ok(group) => {
                state.group = group;
                tracing::info!("MCP servers restarted with new configuration");
                return Ok(());
            }
            Err(e) => e.to_string(),
        };

        tracing::error!("Failed to start new MCP servers, restoring previous configuration: {}", reason);
        match ServerGroup::start(self.launcher.as_ref(), &previous_configs).await {
            Ok(group) => {
                state.group = group;
                tracing::warn!("Previous MCP server configuration restored");
                Err(McpError::RestartRolledBack { reason })
            }
            Err(restore) => {
                tracing::error!(
                    "FATAL: failed to restore previous MCP servers, manual intervention required: {}",
                    restore
                );
                state.group = ServerGroup::stopped(previous_configs);
                Err(McpError::RestoreFailed {
                    reason,
                    restore_reason: restore.to_string(),
                })
            }
        }
    }

    async fn on_settings_changed(&self, event: &SettingsChangeEvent) -> Result<(), McpError> {
        if !event.touches(MCP_SERVERS_KEY) {
            tracing::debug!("Settings change does not affect MCP servers");
            return Ok(());
        }
        tracing::info!("MCP server configuration changed, restarting servers");
        self.replace_group(&event.new.mcp_servers).await
    }

    /// 关闭：先取消配置订阅，再停止服务组
    pub async fn shutdown(&self) {
        let subscription = self.subscription.lock().ok().and_then(|mut s| s.take());
        if let Some(id) = subscription {
            self.settings.unsubscribe(id);
        }

        let mut state = self.state.write().await;
        std::mem::take(&mut state.group).stop().await;
        self.initialized.store(false, Ordering::Release);
        tracing::info!("MCP pool shut down");
    }
}

/// 配置订阅者；持有弱引用，避免 SettingsStore 与进程池互相持有
struct PoolObserver {
    pool: Weak<McpPoolManager>,
}

#[async_trait]
impl SettingsObserver for PoolObserver {
    fn name(&self) -> &str {
        "mcp-pool"
    }

    async fn on_settings_changed(&self, event: &SettingsChangeEvent) -> anyhow::Result<()> {
        let Some(pool) = self.pool.upgrade() else {
            return Ok(());
        };
        pool.on_settings_changed(event).await?;
        Ok(())
    }
}
