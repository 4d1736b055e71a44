//! Mock 模型与脚本化执行：用于测试与 `provider = "mock"` 的本地运行

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use super::execution::{AgentExecution, AgentNode, ExecutionResult, ModelEvent};
use super::model::{ChatModel, CompletionRequest, ModelEventStream};
use crate::conversation::{Message, Usage};
use crate::core::AgentError;

/// 按脚本逐轮回复的模型；脚本用完后回显最后一条用户消息
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Vec<ModelEvent>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    hang: bool,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Vec<ModelEvent>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            hang: false,
        }
    }

    /// 回复 "Echo: {用户消息}"
    pub fn echo() -> Self {
        Self::new(Vec::new())
    }

    /// 每轮事件发完后不结束子流（用于测试停止 / 取消）
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// 收到过的请求
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn echo_turn(request: &CompletionRequest) -> Vec<ModelEvent> {
        let last = request
            .messages
            .iter()
            .rev()
            .find_map(Message::user_text)
            .unwrap_or_default();
        let reply = format!("Echo: {}", last);
        let tokens = reply.split_whitespace().count() as u64;
        vec![
            ModelEvent::TextDelta { content: reply },
            ModelEvent::Usage(Usage {
                total_tokens: tokens,
                request_tokens: 0,
                response_tokens: tokens,
                requests: 0,
            }),
        ]
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ModelEventStream, AgentError> {
        let scripted = self.turns.lock().ok().and_then(|mut t| t.pop_front());
        let events = scripted.unwrap_or_else(|| Self::echo_turn(&request));
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        let events = stream::iter(events.into_iter().map(Ok));
        if self.hang {
            Ok(events.chain(stream::pending()).boxed())
        } else {
            Ok(events.boxed())
        }
    }
}

/// 预先给定节点序列的执行，用于直接驱动 StreamTranslator
pub struct ScriptedExecution {
    nodes: VecDeque<Result<AgentNode, AgentError>>,
    result: ExecutionResult,
}

impl ScriptedExecution {
    pub fn new(nodes: Vec<AgentNode>) -> Self {
        Self::from_results(nodes.into_iter().map(Ok).collect())
    }

    pub fn from_results(nodes: Vec<Result<AgentNode, AgentError>>) -> Self {
        Self {
            nodes: nodes.into(),
            result: ExecutionResult::default(),
        }
    }

    pub fn with_result(mut self, result: ExecutionResult) -> Self {
        self.result = result;
        self
    }
}

#[async_trait]
impl AgentExecution for ScriptedExecution {
    async fn next_node(&mut self) -> Option<Result<AgentNode, AgentError>> {
        self.nodes.pop_front()
    }

    async fn finish(self: Box<Self>) -> Result<ExecutionResult, AgentError> {
        if !self.nodes.is_empty() {
            return Err(AgentError::NotFinished);
        }
        Ok(self.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(text: &str) -> CompletionRequest {
        CompletionRequest {
            system_prompt: String::new(),
            messages: vec![Message::user(text)],
            tools: vec![],
            enable_thinking: false,
            model_settings: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_echo_model() {
        let model = ScriptedModel::echo();
        let events: Vec<_> = model.stream(request("hi there")).await.unwrap().collect().await;
        assert_eq!(
            events[0],
            Ok(ModelEvent::TextDelta {
                content: "Echo: hi there".into()
            })
        );
        assert_eq!(model.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_script_then_echo() {
        let model = ScriptedModel::new(vec![vec![ModelEvent::TextDelta { content: "first".into() }]]);
        let first: Vec<_> = model.stream(request("a")).await.unwrap().collect().await;
        assert_eq!(first.len(), 1);
        let second: Vec<_> = model.stream(request("b")).await.unwrap().collect().await;
        assert_eq!(
            second[0],
            Ok(ModelEvent::TextDelta {
                content: "Echo: b".into()
            })
        );
    }
}
