//! 模型抽象：一次模型请求返回一条 ModelEvent 流
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 ChatModel。

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

use super::execution::ModelEvent;
use crate::conversation::Message;
use crate::core::AgentError;
use crate::mcp::McpTool;

/// 提供给模型的工具描述
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<McpTool> for ToolSpec {
    fn from(tool: McpTool) -> Self {
        Self {
            name: tool.name,
            description: tool.description,
            parameters: tool.input_schema,
        }
    }
}

/// 一次模型请求
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    /// 历史 + 本轮用户输入 + 本次执行中已产生的消息
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub enable_thinking: bool,
    pub model_settings: serde_json::Map<String, Value>,
}

pub type ModelEventStream = BoxStream<'static, Result<ModelEvent, AgentError>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    /// 发起流式请求
    async fn stream(&self, request: CompletionRequest) -> Result<ModelEventStream, AgentError>;
}
