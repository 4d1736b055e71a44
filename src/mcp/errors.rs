//! MCP 服务相关错误

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum McpError {
    #[error("Failed to spawn MCP server '{server}': {reason}")]
    SpawnFailed { server: String, reason: String },

    #[error("MCP server '{server}' initialization failed: {reason}")]
    InitFailed { server: String, reason: String },

    #[error("Transport error on '{server}': {reason}")]
    TransportError { server: String, reason: String },

    #[error("MCP server error {code}: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("Request to '{server}' timed out after {timeout_secs}s")]
    Timeout { server: String, timeout_secs: u64 },

    #[error("MCP server '{server}' is not running")]
    ServerStopped { server: String },

    #[error("Invalid MCP server configuration: {0}")]
    ConfigError(String),

    /// 新配置启动失败，已恢复旧的服务组
    #[error("MCP server restart failed, previous servers restored: {reason}")]
    RestartRolledBack { reason: String },

    /// 新配置启动失败且旧配置也无法恢复，当前没有可用服务
    #[error("MCP server restart failed and restore failed (manual intervention required): {reason}; restore: {restore_reason}")]
    RestoreFailed { reason: String, restore_reason: String },
}
