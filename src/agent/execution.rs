//! Agent 执行契约
//!
//! 一次执行是一串节点：user-prompt → (model-request → call-tools)* → end。
//! model-request 节点带一条模型事件子流，call-tools 节点带一条工具事件子流。
//! 节点与子流都是惰性的：调用方（StreamTranslator）取下一个节点时才发起模型请求，
//! 消费到工具结果时才真正执行工具。全部消费后 `finish` 返回完整消息列表与用量。

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::conversation::{Message, Usage, UserPart};
use crate::core::AgentError;
use crate::mcp::{McpError, ToolServer};

/// 模型请求节点中的细粒度事件
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    ThinkingDelta { content: String },
    TextDelta { content: String },
    /// 一个完整的工具调用（参数已拼接完毕）
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    Usage(Usage),
}

/// 工具调用节点中的事件
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEvent {
    Call {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    Result {
        tool_call_id: String,
        tool_name: String,
        content: String,
    },
}

/// 节点内的事件子流
pub struct EventStream<T> {
    inner: BoxStream<'static, Result<T, AgentError>>,
}

impl<T: Send + 'static> EventStream<T> {
    pub fn new(inner: BoxStream<'static, Result<T, AgentError>>) -> Self {
        Self { inner }
    }

    /// 由固定事件序列构造
    pub fn from_results(events: impl IntoIterator<Item = Result<T, AgentError>>) -> Self {
        let events: Vec<_> = events.into_iter().collect();
        Self::new(stream::iter(events).boxed())
    }

    pub fn from_events(events: impl IntoIterator<Item = T>) -> Self {
        Self::from_results(events.into_iter().map(Ok))
    }

    /// 下一个事件；子流结束时返回 None
    pub async fn next(&mut self) -> Option<Result<T, AgentError>> {
        self.inner.next().await
    }
}

/// 执行节点
pub enum AgentNode {
    UserPrompt,
    ModelRequest(EventStream<ModelEvent>),
    CallTools(EventStream<ToolEvent>),
    End,
}

impl std::fmt::Debug for AgentNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentNode::UserPrompt => "UserPrompt",
            AgentNode::ModelRequest(_) => "ModelRequest",
            AgentNode::CallTools(_) => "CallTools",
            AgentNode::End => "End",
        };
        f.write_str(name)
    }
}

/// 执行完成后的结果：完整消息列表（含历史）与本次执行的用量
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub messages: Vec<Message>,
    pub usage: Usage,
}

/// 一次正在进行的执行
#[async_trait]
pub trait AgentExecution: Send {
    /// 下一个节点；执行结束后返回 None
    async fn next_node(&mut self) -> Option<Result<AgentNode, AgentError>>;

    /// 全部节点消费完后取结果
    async fn finish(self: Box<Self>) -> Result<ExecutionResult, AgentError>;
}

/// 执行的输入内容
#[derive(Debug, Clone, PartialEq)]
pub enum UserContent {
    Text(String),
    Parts(Vec<UserPart>),
}

impl UserContent {
    pub fn into_message(self) -> Message {
        match self {
            UserContent::Text(text) => Message::user(text),
            UserContent::Parts(parts) => Message::UserPrompt { parts },
        }
    }
}

/// 模型标识
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub provider: String,
    pub model: String,
    /// api_key / base_url 等供应商参数
    pub config: std::collections::BTreeMap<String, String>,
    pub model_settings: serde_json::Map<String, Value>,
    pub enable_thinking: bool,
}

/// 工具实际执行的 continuation（惰性：不 poll 就不会调用工具）
pub type ToolCallFuture<'a> = BoxFuture<'a, Result<String, McpError>>;

/// 工具调用拦截器：每个工具调用恰好调用一次，总是返回字符串结果
pub trait ToolInterceptor: Send + Sync {
    fn intercept<'a>(
        &'a self,
        tool_name: &'a str,
        args: &'a Value,
        call: ToolCallFuture<'a>,
    ) -> BoxFuture<'a, String>;
}

/// 启动一次执行所需的全部输入
pub struct ExecutionRequest {
    pub input: UserContent,
    pub history: Vec<Message>,
    pub servers: Vec<Arc<dyn ToolServer>>,
    pub interceptor: Arc<dyn ToolInterceptor>,
    pub system_prompt: String,
    pub model: ModelSpec,
    pub cancel: CancellationToken,
}

/// 执行工厂
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn start(&self, request: ExecutionRequest) -> Result<Box<dyn AgentExecution>, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_stream_from_events_is_closed() {
        let mut stream = EventStream::from_events(vec![
            ModelEvent::TextDelta { content: "a".into() },
            ModelEvent::TextDelta { content: "b".into() },
        ]);
        assert!(matches!(stream.next().await, Some(Ok(ModelEvent::TextDelta { .. }))));
        assert!(matches!(stream.next().await, Some(Ok(_))));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_user_content_into_message() {
        assert_eq!(UserContent::Text("hi".into()).into_message(), Message::user("hi"));
    }
}
