//! mcp-chat - MCP 工具对话服务核心
//!
//! 模块划分：
//! - **agent**: 执行契约、模型客户端（OpenAI 兼容 / Mock）与多步运行时
//! - **approval**: 工具调用审批（人工确认 / 自动批准）
//! - **config**: 进程配置加载（TOML + 环境变量）
//! - **conversation**: 消息模型与对话存储（内存 / SQLite）
//! - **core**: 错误类型、会话监管、优雅关闭
//! - **gateway**: WebSocket 协议、会话编排、HTTP 接口
//! - **mcp**: MCP 服务进程、stdio JSON-RPC、进程池
//! - **observability**: 日志初始化
//! - **settings**: 运行时设置（settings.json）与变更通知
//! - **stream**: 执行事件 → 客户端协议

pub mod agent;
pub mod approval;
pub mod config;
pub mod conversation;
pub mod core;
pub mod gateway;
pub mod mcp;
pub mod observability;
pub mod settings;
pub mod stream;
