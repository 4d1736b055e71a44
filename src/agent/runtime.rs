//! Agent 运行时：模型 ↔ 工具的多步循环
//!
//! `AgentFactory` 为每条用户消息创建一次执行（`McpExecution`）。执行是惰性的状态机：
//! 取 model-request 节点时才请求模型，消费 call-tools 子流时才经拦截器调用工具。
//! 每一步的模型输出与工具结果按顺序追加到消息列表，`finish` 时整体返回。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::execution::{
    AgentExecution, AgentNode, AgentRunner, EventStream, ExecutionRequest, ExecutionResult,
    ModelEvent, ModelSpec, ToolCallFuture, ToolEvent, ToolInterceptor,
};
use super::mock::ScriptedModel;
use super::model::{ChatModel, CompletionRequest, ToolSpec};
use super::openai::OpenAiChatModel;
use crate::conversation::{Message, Usage, TOOL_ERROR_PREFIX};
use crate::core::AgentError;
use crate::mcp::ToolServer;

/// 单次执行最多的模型请求次数
pub const DEFAULT_MAX_STEPS: usize = 20;

/// 执行工厂：解析模型、收集工具、创建执行
pub struct AgentFactory {
    http: reqwest::Client,
    fixed_model: Option<Arc<dyn ChatModel>>,
    max_steps: usize,
}

impl AgentFactory {
    pub fn new(request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout: {}, using defaults", e);
                reqwest::Client::new()
            });
        Self {
            http,
            fixed_model: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// 固定使用某个模型（忽略设置中的 provider），测试与嵌入场景用
    pub fn with_model(model: Arc<dyn ChatModel>) -> Self {
        Self {
            http: reqwest::Client::new(),
            fixed_model: Some(model),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    fn resolve_model(&self, spec: &ModelSpec) -> Result<Arc<dyn ChatModel>, AgentError> {
        if let Some(model) = &self.fixed_model {
            return Ok(model.clone());
        }
        if spec.provider == "mock" {
            return Ok(Arc::new(ScriptedModel::echo()));
        }
        Ok(Arc::new(OpenAiChatModel::from_spec(self.http.clone(), spec)?))
    }
}

#[async_trait]
impl AgentRunner for AgentFactory {
    async fn start(&self, request: ExecutionRequest) -> Result<Box<dyn AgentExecution>, AgentError> {
        let model = self.resolve_model(&request.model)?;
        let (tools, routes) = collect_tools(&request.servers).await;
        info!(
            "Starting agent execution (model: {}, tools: {}, history: {})",
            model.name(),
            tools.len(),
            request.history.len()
        );

        let mut messages = request.history;
        messages.push(request.input.into_message());

        Ok(Box::new(McpExecution {
            model,
            tools,
            routes: Arc::new(routes),
            interceptor: request.interceptor,
            system_prompt: request.system_prompt,
            enable_thinking: request.model.enable_thinking,
            model_settings: request.model.model_settings,
            cancel: request.cancel,
            messages,
            usage: Usage::default(),
            step: 0,
            max_steps: self.max_steps,
            phase: Phase::Start,
            completed: false,
        }))
    }
}

/// 汇总所有服务的工具；同名工具保留先出现者
async fn collect_tools(
    servers: &[Arc<dyn ToolServer>],
) -> (Vec<ToolSpec>, HashMap<String, Arc<dyn ToolServer>>) {
    let mut specs = Vec::new();
    let mut routes: HashMap<String, Arc<dyn ToolServer>> = HashMap::new();
    for server in servers {
        match server.list_tools().await {
            Ok(tools) => {
                for tool in tools {
                    if let Some(owner) = routes.get(&tool.name) {
                        warn!(
                            "Tool '{}' from '{}' shadowed by '{}'",
                            tool.name,
                            server.name(),
                            owner.name()
                        );
                        continue;
                    }
                    routes.insert(tool.name.clone(), server.clone());
                    specs.push(ToolSpec::from(tool));
                }
            }
            Err(e) => warn!("Failed to list tools of '{}': {}", server.name(), e),
        }
    }
    (specs, routes)
}

/// 一次模型回复的累积内容
#[derive(Default)]
struct TurnAccumulator {
    thinking: String,
    text: String,
    calls: Vec<PendingCall>,
    usage: Usage,
}

#[derive(Clone)]
struct PendingCall {
    id: String,
    name: String,
    args: Value,
}

impl TurnAccumulator {
    fn record(&mut self, event: &ModelEvent) {
        match event {
            ModelEvent::ThinkingDelta { content } => self.thinking.push_str(content),
            ModelEvent::TextDelta { content } => self.text.push_str(content),
            ModelEvent::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => {
                let id = if tool_call_id.is_empty() {
                    format!("call_{}", uuid::Uuid::new_v4().simple())
                } else {
                    tool_call_id.clone()
                };
                self.calls.push(PendingCall {
                    id,
                    name: tool_name.clone(),
                    args: args.clone(),
                });
            }
            ModelEvent::Usage(usage) => self.usage.add(usage),
        }
    }

    fn messages(&self) -> Vec<Message> {
        let mut out = Vec::new();
        if !self.thinking.is_empty() {
            out.push(Message::Thinking {
                content: self.thinking.clone(),
            });
        }
        if !self.text.is_empty() {
            out.push(Message::assistant(self.text.clone()));
        }
        out.extend(self.calls.iter().map(|c| Message::ToolCall {
            tool_call_id: c.id.clone(),
            tool_name: c.name.clone(),
            args: c.args.clone(),
        }));
        out
    }
}

type SharedTurn = Arc<Mutex<TurnAccumulator>>;
type SharedResults = Arc<Mutex<Vec<Option<String>>>>;

enum Phase {
    Start,
    NeedModel,
    /// model-request 节点已交出，子流尚在被消费
    AfterModel(SharedTurn),
    /// call-tools 节点已交出
    AfterTools(Vec<PendingCall>, SharedResults),
    Done,
}

/// 基于 ChatModel + MCP 工具的执行
pub struct McpExecution {
    model: Arc<dyn ChatModel>,
    tools: Vec<ToolSpec>,
    routes: Arc<HashMap<String, Arc<dyn ToolServer>>>,
    interceptor: Arc<dyn ToolInterceptor>,
    system_prompt: String,
    enable_thinking: bool,
    model_settings: serde_json::Map<String, Value>,
    cancel: CancellationToken,
    messages: Vec<Message>,
    usage: Usage,
    step: usize,
    max_steps: usize,
    phase: Phase,
    completed: bool,
}

impl McpExecution {
    async fn request_model(&mut self) -> Result<AgentNode, AgentError> {
        if self.step >= self.max_steps {
            return Err(AgentError::StepLimitReached(self.max_steps));
        }
        self.step += 1;
        debug!("Model request step {}/{}", self.step, self.max_steps);

        let request = CompletionRequest {
            system_prompt: self.system_prompt.clone(),
            messages: self.messages.clone(),
            tools: self.tools.clone(),
            enable_thinking: self.enable_thinking,
            model_settings: self.model_settings.clone(),
        };
        let events = self.model.stream(request).await?;

        let turn: SharedTurn = Arc::new(Mutex::new(TurnAccumulator::default()));
        let sink = turn.clone();
        let events = events
            .inspect(move |event| {
                if let (Ok(event), Ok(mut acc)) = (event, sink.lock()) {
                    acc.record(event);
                }
            })
            .boxed();

        self.phase = Phase::AfterModel(turn);
        Ok(AgentNode::ModelRequest(EventStream::new(events)))
    }

    /// 先产出全部 Call 事件，再按完成顺序产出 Result 事件
    fn tool_stream(&self, calls: &[PendingCall], results: SharedResults) -> EventStream<ToolEvent> {
        let call_events: Vec<Result<ToolEvent, AgentError>> = calls
            .iter()
            .map(|c| {
                Ok(ToolEvent::Call {
                    tool_call_id: c.id.clone(),
                    tool_name: c.name.clone(),
                    args: c.args.clone(),
                })
            })
            .collect();

        let running: FuturesUnordered<_> = calls
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, call)| {
                let routes = self.routes.clone();
                let interceptor = self.interceptor.clone();
                let results = results.clone();
                async move {
                    let content = run_tool(routes, interceptor, &call).await;
                    if let Ok(mut slots) = results.lock() {
                        slots[index] = Some(content.clone());
                    }
                    Ok(ToolEvent::Result {
                        tool_call_id: call.id,
                        tool_name: call.name,
                        content,
                    })
                }
            })
            .collect();

        EventStream::new(stream::iter(call_events).chain(running).boxed())
    }

    fn complete_turn(&mut self, turn: SharedTurn) -> Vec<PendingCall> {
        let (messages, usage, calls) = match turn.lock() {
            Ok(acc) => (acc.messages(), acc.usage, acc.calls.clone()),
            Err(_) => (Vec::new(), Usage::default(), Vec::new()),
        };
        self.messages.extend(messages);
        self.usage.add(&usage);
        self.usage.requests += 1;
        calls
    }

    fn complete_tools(&mut self, calls: Vec<PendingCall>, results: SharedResults) {
        let results = results.lock().map(|r| r.clone()).unwrap_or_default();
        for (index, call) in calls.into_iter().enumerate() {
            let content = results.get(index).cloned().flatten().unwrap_or_else(|| {
                format!("{}tool call did not complete", TOOL_ERROR_PREFIX)
            });
            self.messages
                .push(Message::tool_result(call.id, call.name, content));
        }
    }
}

async fn run_tool(
    routes: Arc<HashMap<String, Arc<dyn ToolServer>>>,
    interceptor: Arc<dyn ToolInterceptor>,
    call: &PendingCall,
) -> String {
    let Some(server) = routes.get(&call.name).cloned() else {
        warn!("Model requested unknown tool '{}'", call.name);
        return format!("{}unknown tool '{}'", TOOL_ERROR_PREFIX, call.name);
    };
    let name = call.name.as_str();
    let args = &call.args;
    let invoke: ToolCallFuture<'_> =
        Box::pin(async move { server.call_tool(name, args.clone()).await });
    interceptor.intercept(name, args, invoke).await
}

#[async_trait]
impl AgentExecution for McpExecution {
    async fn next_node(&mut self) -> Option<Result<AgentNode, AgentError>> {
        loop {
            if matches!(self.phase, Phase::Done) {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.phase = Phase::Done;
                return Some(Err(AgentError::Cancelled));
            }

            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Start => {
                    self.phase = Phase::NeedModel;
                    return Some(Ok(AgentNode::UserPrompt));
                }
                Phase::NeedModel => return Some(self.request_model().await),
                Phase::AfterModel(turn) => {
                    let calls = self.complete_turn(turn);
                    if calls.is_empty() {
                        self.completed = true;
                        info!(
                            "Agent execution finished after {} step(s), {} tokens",
                            self.step, self.usage.total_tokens
                        );
                        return Some(Ok(AgentNode::End));
                    }
                    let results: SharedResults = Arc::new(Mutex::new(vec![None; calls.len()]));
                    let node = AgentNode::CallTools(self.tool_stream(&calls, results.clone()));
                    self.phase = Phase::AfterTools(calls, results);
                    return Some(Ok(node));
                }
                Phase::AfterTools(calls, results) => {
                    self.complete_tools(calls, results);
                    self.phase = Phase::NeedModel;
                }
                Phase::Done => return None,
            }
        }
    }

    async fn finish(self: Box<Self>) -> Result<ExecutionResult, AgentError> {
        if !self.completed {
            return Err(AgentError::NotFinished);
        }
        Ok(ExecutionResult {
            messages: self.messages,
            usage: self.usage,
        })
    }
}
