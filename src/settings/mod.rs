//! 运行时设置（settings.json）
//!
//! 与 `config.rs` 的进程级静态配置不同，这里是可在运行时通过 API / WebSocket 修改的设置：
//! 系统提示词、模型、审批策略、MCP 服务列表。修改后通知订阅者（如 MCP 进程池）。

mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use store::{SettingsChangeEvent, SettingsObserver, SettingsStore, SubscriptionId};

/// 设置读写错误
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid settings: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// 设置已保存，但有订阅者处理变更失败
    #[error("Settings saved but observers failed: {}", .0.join("; "))]
    Observer(Vec<String>),
}

/// 单个 MCP 服务的启动配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl McpServerConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: BTreeMap::new(),
            cwd: None,
        }
    }
}

/// llm_provider 段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmProviderSettings {
    /// openai / deepseek / google-gla / openrouter / ollama / mock
    pub provider: String,
    pub model: String,
    /// 供应商参数：api_key、base_url
    pub config: BTreeMap<String, String>,
    /// 透传给模型的参数（temperature、max_tokens 等）
    pub model_settings: serde_json::Map<String, serde_json::Value>,
}

impl Default for LlmProviderSettings {
    fn default() -> Self {
        Self {
            provider: "google-gla".to_string(),
            model: "gemini-2.5-flash".to_string(),
            config: BTreeMap::new(),
            model_settings: serde_json::Map::new(),
        }
    }
}

/// settings.json 的完整结构
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub system_prompt: String,
    pub llm_provider: LlmProviderSettings,
    /// 审批等待超时（秒）
    pub approval_timeout: f64,
    pub auto_approve_tools: bool,
    pub debug_mode: bool,
    pub enable_thinking: bool,
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut mcp_servers = BTreeMap::new();
        mcp_servers.insert(
            "desktop-commander".to_string(),
            McpServerConfig::new(
                "npx",
                vec!["-y".into(), "@wonderwhy-er/desktop-commander".into()],
            ),
        );
        mcp_servers.insert(
            "context7".to_string(),
            McpServerConfig::new("npx", vec!["-y".into(), "@upstash/context7-mcp".into()]),
        );

        Self {
            system_prompt: "You are a helpful AI assistant.".to_string(),
            llm_provider: LlmProviderSettings::default(),
            approval_timeout: 60.0,
            auto_approve_tools: false,
            debug_mode: false,
            enable_thinking: true,
            mcp_servers,
        }
    }
}

impl Settings {
    /// 校验设置，收集全部问题而不是遇到第一个就返回
    pub fn validate(&self) -> Result<(), SettingsError> {
        let mut problems = Vec::new();

        if self.system_prompt.trim().is_empty() {
            problems.push("system_prompt must not be empty".to_string());
        }
        if self.llm_provider.provider.trim().is_empty() {
            problems.push("llm_provider.provider must not be empty".to_string());
        }
        if self.llm_provider.model.trim().is_empty() {
            problems.push("llm_provider.model must not be empty".to_string());
        }
        if !(self.approval_timeout.is_finite() && self.approval_timeout > 0.0) {
            problems.push("approval_timeout must be a positive number".to_string());
        }
        for (name, server) in &self.mcp_servers {
            problems.extend(validate_server(name, server));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::Validation(problems))
        }
    }

    /// 与另一份设置相比，发生变化的顶层键
    pub fn changed_keys(&self, other: &Settings) -> BTreeSet<String> {
        let (Ok(serde_json::Value::Object(a)), Ok(serde_json::Value::Object(b))) =
            (serde_json::to_value(self), serde_json::to_value(other))
        else {
            return BTreeSet::new();
        };

        a.keys()
            .chain(b.keys())
            .filter(|k| a.get(*k) != b.get(*k))
            .cloned()
            .collect()
    }
}

/// 单个 MCP 服务配置的校验
pub fn validate_server(name: &str, server: &McpServerConfig) -> Vec<String> {
    let mut problems = Vec::new();
    if name.trim().is_empty() {
        problems.push("mcp server name must not be empty".to_string());
    }
    if server.command.trim().is_empty() {
        problems.push(format!("mcp server '{}': command must not be empty", name));
    }
    if server.env.keys().any(|k| k.trim().is_empty()) {
        problems.push(format!("mcp server '{}': env keys must not be empty", name));
    }
    problems
}
