//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MCP_CHAT__*` 覆盖（双下划线表示嵌套，如
//! `MCP_CHAT__SERVER__BIND_ADDR=0.0.0.0:8000`）。`PORT` 单独覆盖监听端口。
//! 运行时可修改的设置（模型、审批、MCP 服务）不在这里，见 `settings` 模块。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub storage: StorageSection,
    pub mcp: McpSection,
    pub agent: AgentSection,
}

/// [server] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:8000".to_string()
}

/// [storage] 段：对话数据库与运行时设置文件
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    /// 为空时使用内存存储
    #[serde(default = "default_database_path")]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            settings_path: default_settings_path(),
        }
    }
}

fn default_database_path() -> Option<PathBuf> {
    Some(PathBuf::from("conversations.db"))
}

fn default_settings_path() -> PathBuf {
    PathBuf::from("settings.json")
}

/// [mcp] 段：MCP 服务握手与单次工具调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct McpSection {
    #[serde(default = "default_init_timeout_secs")]
    pub init_timeout_secs: u64,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for McpSection {
    fn default() -> Self {
        Self {
            init_timeout_secs: default_init_timeout_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_init_timeout_secs() -> u64 {
    30
}

fn default_tool_timeout_secs() -> u64 {
    120
}

/// [agent] 段：单次执行的最大模型请求轮数、HTTP 请求超时
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_max_steps() -> usize {
    20
}

fn default_request_timeout_secs() -> u64 {
    300
}

/// 从 config 目录加载配置，环境变量 MCP_CHAT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 MCP_CHAT__*（双下划线表示嵌套键）
/// 4. 最后 PORT 覆盖 bind_addr 的端口
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MCP_CHAT")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let mut cfg: AppConfig = c.try_deserialize()?;

    if let Ok(port) = std::env::var("PORT") {
        cfg.server.bind_addr = with_port(&cfg.server.bind_addr, &port);
    }
    Ok(cfg)
}

fn with_port(bind_addr: &str, port: &str) -> String {
    let host = bind_addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(bind_addr);
    format!("{}:{}", host, port.trim())
}
