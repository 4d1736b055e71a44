//! 执行事件 → 客户端协议的状态机
//!
//! 模型节点内：idle / thinking-open / text-open 三态，保证思考气泡在文本气泡打开前关闭，
//! 且不会出现两个连续的 `*_start`。工具节点内：第一条调用打开 tool session，节点结束时关闭。
//! `sent_complete` 保证顶层 `assistant_complete` 只发一次。

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::agent::{AgentExecution, AgentNode, EventStream, ModelEvent, ToolEvent};
use crate::conversation::{is_denied, EMPTY_TOOL_OUTPUT};
use crate::core::{AgentError, ChatError};
use crate::gateway::{Messenger, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bubble {
    Idle,
    Thinking,
    Text,
}

pub struct StreamTranslator {
    messenger: Arc<dyn Messenger>,
    sent_complete: bool,
}

/// 在取消令牌与 future 之间 select；取消时返回 Err(Cancelled)
macro_rules! or_cancel {
    ($cancel:expr, $fut:expr) => {
        tokio::select! {
            biased;
            _ = $cancel.cancelled() => return Err(ChatError::Cancelled),
            v = $fut => v,
        }
    };
}

impl StreamTranslator {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self {
            messenger,
            sent_complete: false,
        }
    }

    /// 消费整个执行并推送事件
    ///
    /// 取消时静默返回 `ChatError::Cancelled`；其他错误推送一条 `error` 后返回
    /// `ChatError::StreamAborted`（调用方不再重复上报）。
    pub async fn translate(
        &mut self,
        execution: &mut dyn AgentExecution,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        self.sent_complete = false;
        match self.drain(execution, cancel).await {
            Ok(()) => Ok(()),
            Err(ChatError::Cancelled) | Err(ChatError::Agent(AgentError::Cancelled)) => {
                debug!("Stream translation cancelled");
                Err(ChatError::Cancelled)
            }
            Err(e) => {
                error!("Stream translation failed: {}", e);
                let message = e.to_string();
                self.send(ServerEvent::error(format!("Error processing message: {}", message)));
                Err(ChatError::StreamAborted(message))
            }
        }
    }

    async fn drain(
        &mut self,
        execution: &mut dyn AgentExecution,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        while let Some(node) = or_cancel!(cancel, execution.next_node()) {
            match node? {
                AgentNode::UserPrompt => {}
                AgentNode::ModelRequest(events) => self.model_node(events, cancel).await?,
                AgentNode::CallTools(events) => self.tools_node(events, cancel).await?,
                AgentNode::End => {
                    if !self.sent_complete {
                        self.send(ServerEvent::AssistantComplete);
                        self.sent_complete = true;
                    }
                }
            }
        }
        Ok(())
    }

    async fn model_node(
        &mut self,
        mut events: EventStream<ModelEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        let mut bubble = Bubble::Idle;
        while let Some(event) = or_cancel!(cancel, events.next()) {
            match event? {
                ModelEvent::ThinkingDelta { content } => {
                    if bubble == Bubble::Text {
                        self.close(bubble);
                        bubble = Bubble::Idle;
                    }
                    if bubble == Bubble::Idle {
                        self.send(ServerEvent::ThinkingStart);
                        bubble = Bubble::Thinking;
                    }
                    self.send(ServerEvent::ThinkingDelta { content });
                }
                ModelEvent::TextDelta { content } => {
                    if content.is_empty() {
                        continue;
                    }
                    if bubble == Bubble::Thinking {
                        self.close(bubble);
                        bubble = Bubble::Idle;
                    }
                    if bubble == Bubble::Idle {
                        self.send(ServerEvent::AssistantStart);
                        bubble = Bubble::Text;
                    }
                    self.send(ServerEvent::TextDelta { content });
                }
                // 工具调用在工具节点中呈现，usage 由执行结果汇总
                ModelEvent::ToolCall { .. } | ModelEvent::Usage(_) => {}
            }
        }
        self.close(bubble);
        Ok(())
    }

    async fn tools_node(
        &mut self,
        mut events: EventStream<ToolEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        let mut session_open = false;
        let mut names: HashMap<String, String> = HashMap::new();
        while let Some(event) = or_cancel!(cancel, events.next()) {
            match event? {
                ToolEvent::Call {
                    tool_call_id,
                    tool_name,
                    ..
                } => {
                    if !session_open {
                        self.send(ServerEvent::ToolSessionStart);
                        session_open = true;
                    }
                    names.insert(tool_call_id.clone(), tool_name.clone());
                    self.send(ServerEvent::ToolStart {
                        tool_name,
                        tool_id: tool_call_id,
                    });
                }
                ToolEvent::Result {
                    tool_call_id,
                    tool_name,
                    content,
                } => {
                    let tool_name = names.get(&tool_call_id).cloned().unwrap_or(tool_name);
                    if is_denied(&content) {
                        self.send(ServerEvent::ToolBlocked {
                            tool_id: tool_call_id,
                            tool_name,
                        });
                    } else {
                        let content = if content.trim().is_empty() {
                            EMPTY_TOOL_OUTPUT.to_string()
                        } else {
                            content
                        };
                        self.send(ServerEvent::ToolComplete {
                            tool_id: tool_call_id,
                            tool_name,
                            content,
                        });
                    }
                }
            }
        }
        if session_open {
            self.send(ServerEvent::ToolSessionComplete);
        }
        Ok(())
    }

    fn close(&mut self, bubble: Bubble) {
        match bubble {
            Bubble::Idle => {}
            Bubble::Thinking => self.send(ServerEvent::ThinkingComplete),
            Bubble::Text => {
                self.send(ServerEvent::AssistantComplete);
                self.sent_complete = true;
            }
        }
    }

    fn send(&self, event: ServerEvent) {
        self.messenger.send(event);
    }
}
