//! WebSocket 消息协议定义
//!
//! 服务端 → 客户端为 `ServerEvent`，客户端 → 服务端为 `ClientMessage`；
//! 均为 `{"type": "...", ...}` 形式的 JSON 对象。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 服务端推送的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// 连接就绪 / 设置已更新
    SystemReady { message: String },

    /// 助手文本气泡
    AssistantStart,
    TextDelta { content: String },
    AssistantComplete,

    /// 思考气泡
    ThinkingStart,
    ThinkingDelta { content: String },
    ThinkingComplete,

    /// 一轮工具调用
    ToolSessionStart,
    ToolStart { tool_name: String, tool_id: String },
    ToolComplete {
        tool_id: String,
        tool_name: String,
        content: String,
    },
    ToolBlocked { tool_id: String, tool_name: String },
    ToolSessionComplete,

    /// 请求用户审批工具调用
    ApprovalRequest {
        approval_id: String,
        tool_name: String,
        args: Value,
    },

    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn system_ready(message: impl Into<String>) -> Self {
        ServerEvent::SystemReady {
            message: message.into(),
        }
    }

    /// 事件类型名（日志用）
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::SystemReady { .. } => "system_ready",
            ServerEvent::AssistantStart => "assistant_start",
            ServerEvent::TextDelta { .. } => "text_delta",
            ServerEvent::AssistantComplete => "assistant_complete",
            ServerEvent::ThinkingStart => "thinking_start",
            ServerEvent::ThinkingDelta { .. } => "thinking_delta",
            ServerEvent::ThinkingComplete => "thinking_complete",
            ServerEvent::ToolSessionStart => "tool_session_start",
            ServerEvent::ToolStart { .. } => "tool_start",
            ServerEvent::ToolComplete { .. } => "tool_complete",
            ServerEvent::ToolBlocked { .. } => "tool_blocked",
            ServerEvent::ToolSessionComplete => "tool_session_complete",
            ServerEvent::ApprovalRequest { .. } => "approval_request",
            ServerEvent::Error { .. } => "error",
        }
    }
}

/// 图片附件（base64 编码）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAttachment {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "mediaType", default = "default_media_type")]
    pub media_type: String,
    pub data: String,
}

fn default_media_type() -> String {
    "image/png".to_string()
}

/// 客户端发来的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ChatMessage {
        #[serde(default)]
        content: String,
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        images: Vec<ImageAttachment>,
    },
    ApprovalResponse {
        approval_id: String,
        #[serde(default)]
        approved: bool,
    },
    EditUserMessage {
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        user_message_index: Option<usize>,
        #[serde(default)]
        new_content: String,
    },
    StopStream {
        #[serde(default)]
        conversation_id: Option<String>,
    },
    /// 设置本身通过 REST 保存；这里只做确认，下一次操作读取新值
    UpdateSettings {
        #[serde(default)]
        settings: Option<Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_event_wire_format() {
        let event = ServerEvent::ToolStart {
            tool_name: "read_file".into(),
            tool_id: "c1".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "tool_start", "tool_name": "read_file", "tool_id": "c1"})
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::AssistantComplete).unwrap(),
            json!({"type": "assistant_complete"})
        );
        assert_eq!(event.kind(), "tool_start");
    }

    #[test]
    fn test_parse_chat_message() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"chat_message","content":"hi","conversation_id":"c1"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::ChatMessage {
                content: "hi".into(),
                conversation_id: Some("c1".into()),
                images: vec![],
            }
        );
    }

    #[test]
    fn test_parse_edit_and_images() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "edit_user_message",
            "conversation_id": "c1",
            "user_message_index": 2,
            "new_content": "again"
        }))
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::EditUserMessage { user_message_index: Some(2), .. }
        ));

        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "chat_message",
            "content": "",
            "conversation_id": "c1",
            "images": [{"name": "a.png", "data": "AQID"}]
        }))
        .unwrap();
        match msg {
            ClientMessage::ChatMessage { images, .. } => assert_eq!(images[0].media_type, "image/png"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"bogus"}"#).is_err());
    }
}
