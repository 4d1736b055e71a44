//! Agent 层：执行契约、模型抽象与实现、运行时
//!
//! - **execution**: 节点 / 事件流契约（AgentExecution、AgentRunner、ToolInterceptor）
//! - **model**: ChatModel 抽象
//! - **openai**: OpenAI 兼容的 SSE 流式客户端
//! - **mock**: 脚本化模型与执行
//! - **runtime**: AgentFactory 与多步执行

pub mod execution;
pub mod mock;
pub mod model;
pub mod openai;
pub mod runtime;

pub use execution::{
    AgentExecution, AgentNode, AgentRunner, EventStream, ExecutionRequest, ExecutionResult,
    ModelEvent, ModelSpec, ToolCallFuture, ToolEvent, ToolInterceptor, UserContent,
};
pub use mock::{ScriptedExecution, ScriptedModel};
pub use model::{ChatModel, CompletionRequest, ModelEventStream, ToolSpec};
pub use openai::OpenAiChatModel;
pub use runtime::{AgentFactory, McpExecution, DEFAULT_MAX_STEPS};
