//! OpenAI 兼容的流式 Chat Completions 客户端
//!
//! 通过 reqwest 直接调用 `{base_url}/chat/completions`（`stream: true`），把 SSE 数据块
//! 解析为 ModelEvent：文本增量、思考增量（`reasoning_content` / `reasoning`）、
//! 按 index 拼接的工具调用、以及末尾的 usage。
//!
//! 支持的 provider：openai、deepseek、google-gla（Gemini 的 OpenAI 兼容端点）、openrouter、ollama。
//! `config.base_url` / `config.api_key` 可覆盖默认值。

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::execution::{ModelEvent, ModelSpec};
use super::model::{ChatModel, CompletionRequest, ModelEventStream};
use crate::conversation::{Message, Usage, UserPart};
use crate::core::AgentError;

struct ProviderDefaults {
    base_url: &'static str,
    api_key_env: Option<&'static str>,
}

fn provider_defaults(provider: &str) -> Option<ProviderDefaults> {
    let (base_url, api_key_env) = match provider {
        "openai" => ("https://api.openai.com/v1", Some("OPENAI_API_KEY")),
        "deepseek" => ("https://api.deepseek.com/v1", Some("DEEPSEEK_API_KEY")),
        "google-gla" => (
            "https://generativelanguage.googleapis.com/v1beta/openai",
            Some("GEMINI_API_KEY"),
        ),
        "openrouter" => ("https://openrouter.ai/api/v1", Some("OPENROUTER_API_KEY")),
        "ollama" => ("http://localhost:11434/v1", None),
        _ => return None,
    };
    Some(ProviderDefaults {
        base_url,
        api_key_env,
    })
}

/// OpenAI 兼容模型
pub struct OpenAiChatModel {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    label: String,
}

impl std::fmt::Debug for OpenAiChatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatModel")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiChatModel {
    /// 由 provider 设置构造
    ///
    /// - 未知 provider 仅在提供了 `config.base_url` 时可用
    /// - 需要 key 的 provider 依次取 `config.api_key`、对应环境变量
    pub fn from_spec(http: reqwest::Client, spec: &ModelSpec) -> Result<Self, AgentError> {
        let defaults = provider_defaults(&spec.provider);
        let base_url = match (spec.config.get("base_url"), &defaults) {
            (Some(url), _) => url.clone(),
            (None, Some(d)) => d.base_url.to_string(),
            (None, None) => return Err(AgentError::UnknownProvider(spec.provider.clone())),
        };

        let api_key = match spec.config.get("api_key") {
            Some(key) => Some(key.clone()),
            None => match defaults.as_ref().and_then(|d| d.api_key_env) {
                Some(var) => Some(std::env::var(var).map_err(|_| AgentError::MissingApiKey {
                    provider: spec.provider.clone(),
                    env_var: var.to_string(),
                })?),
                None => None,
            },
        };

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: spec.model.clone(),
            label: format!("{}:{}", spec.provider, spec.model),
        })
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), json!(self.model));
        body.insert("messages".into(), Value::Array(to_wire_messages(request)));
        body.insert("stream".into(), json!(true));
        body.insert("stream_options".into(), json!({"include_usage": true}));
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body.insert("tools".into(), Value::Array(tools));
        }
        // temperature / max_tokens 等原样透传
        for (key, value) in &request.model_settings {
            body.insert(key.clone(), value.clone());
        }
        Value::Object(body)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.label
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ModelEventStream, AgentError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&request);
        debug!("POST {} ({} messages)", url, request.messages.len());

        let mut builder = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::NetworkTimeout
            } else {
                AgentError::LlmError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Model endpoint returned {}: {}", status, text);
            return Err(AgentError::LlmError(format!("HTTP {}: {}", status, text)));
        }

        Ok(parse_sse_stream(response, request.enable_thinking))
    }
}

/// 把对话消息转为 OpenAI wire 格式：system 在前；连续的助手文本与工具调用合并成一条 assistant 消息
fn to_wire_messages(request: &CompletionRequest) -> Vec<Value> {
    let mut out = vec![json!({"role": "system", "content": request.system_prompt})];
    let mut assistant: Option<(String, Vec<Value>)> = None;

    fn flush(out: &mut Vec<Value>, assistant: &mut Option<(String, Vec<Value>)>) {
        if let Some((content, calls)) = assistant.take() {
            let mut msg = json!({"role": "assistant", "content": content});
            if !calls.is_empty() {
                msg["tool_calls"] = Value::Array(calls);
            }
            out.push(msg);
        }
    }

    for message in &request.messages {
        match message {
            Message::UserPrompt { parts } => {
                flush(&mut out, &mut assistant);
                out.push(json!({"role": "user", "content": user_content(parts)}));
            }
            Message::AssistantText { content } => {
                assistant.get_or_insert_with(Default::default).0.push_str(content);
            }
            Message::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => {
                assistant.get_or_insert_with(Default::default).1.push(json!({
                    "id": tool_call_id,
                    "type": "function",
                    "function": {"name": tool_name, "arguments": args.to_string()},
                }));
            }
            Message::ToolResult {
                tool_call_id,
                content,
                ..
            } => {
                flush(&mut out, &mut assistant);
                out.push(json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}));
            }
            Message::Thinking { .. } | Message::SystemNotice { .. } => {}
        }
    }
    flush(&mut out, &mut assistant);
    out
}

fn user_content(parts: &[UserPart]) -> Value {
    if let [UserPart::Text { text }] = parts {
        return json!(text);
    }
    let items: Vec<Value> = parts
        .iter()
        .map(|part| match part {
            UserPart::Text { text } => json!({"type": "text", "text": text}),
            UserPart::Binary {
                media_type, data, ..
            } => json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{};base64,{}", media_type, BASE64.encode(data))},
            }),
        })
        .collect();
    Value::Array(items)
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

/// 跨 SSE 事件累积工具调用片段
#[derive(Default)]
struct SseState {
    enable_thinking: bool,
    /// (index, id, name, arguments)
    pending_calls: Vec<(u32, String, String, String)>,
    done: bool,
}

impl SseState {
    /// 处理一个 SSE 事件（可能含多行 data:）
    fn process_event(&mut self, event: &str) -> Result<Vec<ModelEvent>, AgentError> {
        let mut data = String::new();
        for line in event.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                let rest = rest.trim();
                if rest == "[DONE]" {
                    self.done = true;
                    return Ok(self.flush_calls());
                }
                data.push_str(rest);
            }
        }
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let chunk: ChunkPayload = serde_json::from_str(&data)
            .map_err(|e| AgentError::JsonParseError(format!("{} (data: {})", e, data)))?;
        Ok(self.process_chunk(chunk))
    }

    fn process_chunk(&mut self, chunk: ChunkPayload) -> Vec<ModelEvent> {
        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(reasoning) = choice.delta.reasoning_content {
                if self.enable_thinking && !reasoning.is_empty() {
                    events.push(ModelEvent::ThinkingDelta { content: reasoning });
                }
            }
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    events.push(ModelEvent::TextDelta { content });
                }
            }
            for tc in choice.delta.tool_calls.unwrap_or_default() {
                let index = tc.index.unwrap_or(0);
                let (name, args) = tc
                    .function
                    .map(|f| (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()))
                    .unwrap_or_default();
                match self.pending_calls.iter_mut().find(|(i, ..)| *i == index) {
                    Some((_, id, pending_name, pending_args)) => {
                        if let Some(new_id) = tc.id {
                            *id = new_id;
                        }
                        pending_name.push_str(&name);
                        pending_args.push_str(&args);
                    }
                    None => self
                        .pending_calls
                        .push((index, tc.id.unwrap_or_default(), name, args)),
                }
            }
            if choice.finish_reason.is_some() {
                events.extend(self.flush_calls());
            }
        }
        if let Some(usage) = chunk.usage {
            events.push(ModelEvent::Usage(Usage {
                total_tokens: usage.total_tokens.max(usage.prompt_tokens + usage.completion_tokens),
                request_tokens: usage.prompt_tokens,
                response_tokens: usage.completion_tokens,
                requests: 0,
            }));
        }
        events
    }

    fn flush_calls(&mut self) -> Vec<ModelEvent> {
        std::mem::take(&mut self.pending_calls)
            .into_iter()
            .map(|(_, id, name, raw_args)| {
                let args = if raw_args.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&raw_args).unwrap_or_else(|e| {
                        warn!("Tool call '{}' has malformed arguments: {}", name, e);
                        json!({"_raw": raw_args})
                    })
                };
                ModelEvent::ToolCall {
                    tool_call_id: id,
                    tool_name: name,
                    args,
                }
            })
            .collect()
    }
}

/// 把 HTTP 响应体解析为 ModelEvent 流
fn parse_sse_stream(response: reqwest::Response, enable_thinking: bool) -> ModelEventStream {
    let state = SseState {
        enable_thinking,
        ..Default::default()
    };
    parse_sse_bytes(response.bytes_stream().boxed(), state)
}

fn parse_sse_bytes<S, B>(bytes: S, state: SseState) -> ModelEventStream
where
    S: futures_util::Stream<Item = Result<B, reqwest::Error>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    stream::unfold(
        (bytes, state, String::new(), std::collections::VecDeque::new()),
        |(mut bytes, mut state, mut buffer, mut ready)| async move {
            loop {
                if let Some(event) = ready.pop_front() {
                    return Some((Ok(event), (bytes, state, buffer, ready)));
                }
                if state.done {
                    return None;
                }

                if let Some(end) = buffer.find("\n\n") {
                    let event = buffer[..end].to_string();
                    buffer = buffer[end + 2..].to_string();
                    match state.process_event(&event) {
                        Ok(events) => ready.extend(events),
                        Err(e) => {
                            state.done = true;
                            return Some((Err(e), (bytes, state, buffer, ready)));
                        }
                    }
                    continue;
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(chunk.as_ref()).replace("\r\n", "\n"));
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((
                            Err(AgentError::StreamError(e.to_string())),
                            (bytes, state, buffer, ready),
                        ));
                    }
                    None => {
                        // 流结束：处理残留数据并补发未完成的工具调用
                        state.done = true;
                        let rest = std::mem::take(&mut buffer);
                        match state.process_event(rest.trim()) {
                            Ok(events) => ready.extend(events),
                            Err(e) => return Some((Err(e), (bytes, state, buffer, ready))),
                        }
                        ready.extend(state.flush_calls());
                    }
                }
            }
        },
    )
    .boxed()
}
