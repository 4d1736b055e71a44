//! 对话消息模型：用户输入、助手文本、思考、工具调用 / 结果、系统提示

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 拦截器拒绝工具调用时返回的固定结果，StreamTranslator 据此发出 tool_blocked
pub const TOOL_DENIED_RESULT: &str = "Tool execution denied by user";

/// 拦截器捕获工具错误后的结果前缀
pub const TOOL_ERROR_PREFIX: &str = "Error occurred: ";

/// 空工具输出的占位文本
pub const EMPTY_TOOL_OUTPUT: &str = "Tool executed (no output)";

/// 用户输入的组成部分：文本或二进制附件（图片）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserPart {
    Text {
        text: String,
    },
    Binary {
        media_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

/// 工具调用结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success,
    Blocked,
    Error,
}

impl ToolOutcome {
    pub fn classify(content: &str) -> Self {
        if is_denied(content) {
            ToolOutcome::Blocked
        } else if content.starts_with(TOOL_ERROR_PREFIX) {
            ToolOutcome::Error
        } else {
            ToolOutcome::Success
        }
    }
}

/// 结果是否表示"被用户拒绝"
pub fn is_denied(content: &str) -> bool {
    content.trim() == TOOL_DENIED_RESULT
}

/// 对话中的一条消息（追加后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    UserPrompt {
        parts: Vec<UserPart>,
    },
    AssistantText {
        content: String,
    },
    Thinking {
        content: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: String,
        outcome: ToolOutcome,
    },
    SystemNotice {
        content: String,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Message::UserPrompt {
            parts: vec![UserPart::Text { text: text.into() }],
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message::AssistantText {
            content: content.into(),
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Message::ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            outcome: ToolOutcome::classify(&content),
            content,
        }
    }

    pub fn is_user_prompt(&self) -> bool {
        matches!(self, Message::UserPrompt { .. })
    }

    /// 用户消息中的文本（多段以换行拼接），非用户消息返回 None
    pub fn user_text(&self) -> Option<String> {
        match self {
            Message::UserPrompt { parts } => Some(
                parts
                    .iter()
                    .filter_map(|p| match p {
                        UserPart::Text { text } => Some(text.as_str()),
                        UserPart::Binary { .. } => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            _ => None,
        }
    }
}

/// 第 `index` 条用户消息（只数用户消息）在整个历史中的位置
pub fn user_message_position(messages: &[Message], index: usize) -> Option<usize> {
    messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_user_prompt())
        .nth(index)
        .map(|(pos, _)| pos)
}

/// Token / 请求计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub total_tokens: u64,
    pub request_tokens: u64,
    pub response_tokens: u64,
    pub requests: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.total_tokens += other.total_tokens;
        self.request_tokens += other.request_tokens;
        self.response_tokens += other.response_tokens;
        self.requests += other.requests;
    }
}

/// 一个完整的对话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            conversation_id: self.conversation_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            message_count: self.messages.len(),
            preview: preview_of(&self.messages),
        }
    }
}

/// 对话列表项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub preview: String,
}

const PREVIEW_CHARS: usize = 100;

/// 第一条用户消息的前 100 个字符
pub fn preview_of(messages: &[Message]) -> String {
    let text = messages.iter().find_map(Message::user_text).unwrap_or_default();
    if text.chars().count() > PREVIEW_CHARS {
        let cut: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", cut)
    } else {
        text
    }
}

mod base64_bytes {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
