//! WebSocket 连接处理
//!
//! 每个连接：一个写任务（mpsc → socket）、一个 Messenger、一个 ConversationOrchestrator。
//! 读循环只做解析与分发，chat / edit 在编排器的后台任务中执行，不阻塞后续的审批应答与 stop。

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::message::{ClientMessage, ServerEvent};
use super::messenger::{Messenger, WebSocketMessenger};
use super::orchestrator::{ChatServices, ConversationOrchestrator};
use super::server::AppState;

pub const READY_MESSAGE: &str = "MCP servers ready! You can start chatting.";

const KNOWN_TYPES: [&str; 5] = [
    "chat_message",
    "approval_response",
    "edit_user_message",
    "stop_stream",
    "update_settings",
];

/// GET /ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let services = state.services.clone();
    ws.on_upgrade(move |socket| handle_connection(socket, services))
}

/// 处理单个 WebSocket 连接，直到客户端断开
pub async fn handle_connection(socket: WebSocket, services: ChatServices) {
    info!("New WebSocket connection established");
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let messenger: Arc<dyn Messenger> = Arc::new(WebSocketMessenger::new(tx));
    let orchestrator = ConversationOrchestrator::new(messenger.clone(), services);
    orchestrator.send_ready(READY_MESSAGE);

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => dispatch(&orchestrator, messenger.as_ref(), &text),
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket receive error: {}", e);
                break;
            }
        }
    }

    info!("Cleaning up WebSocket connection");
    orchestrator.cleanup().await;
    writer.abort();
    info!("WebSocket connection closed");
}

/// 解析并分发一条客户端消息
fn dispatch(orchestrator: &Arc<ConversationOrchestrator>, messenger: &dyn Messenger, raw: &str) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => {
            error!("Invalid JSON received from client");
            messenger.send(ServerEvent::error("Invalid JSON format"));
            return;
        }
    };

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if !KNOWN_TYPES.contains(&kind.as_str()) {
        warn!("Unknown message type: {}", kind);
        return;
    }

    let message: ClientMessage = match serde_json::from_value(value) {
        Ok(m) => m,
        Err(e) => {
            error!("Malformed {} message: {}", kind, e);
            messenger.send(ServerEvent::error(format!("Invalid message format: {}", e)));
            return;
        }
    };

    match message {
        ClientMessage::ChatMessage {
            content,
            conversation_id,
            images,
        } => {
            let Some(conversation_id) = conversation_id.filter(|id| !id.is_empty()) else {
                error!("Missing conversation_id from client message");
                messenger.send(ServerEvent::error("Missing conversation_id"));
                return;
            };
            let content = content.trim().to_string();
            if content.is_empty() && images.is_empty() {
                return;
            }
            info!("Received chat message for conversation: {}", conversation_id);
            orchestrator.spawn_chat(content, conversation_id, images);
        }
        ClientMessage::ApprovalResponse {
            approval_id,
            approved,
        } => {
            info!("Received approval response: {} = {}", approval_id, approved);
            orchestrator.handle_approval_response(&approval_id, approved);
        }
        ClientMessage::EditUserMessage {
            conversation_id,
            user_message_index,
            new_content,
        } => {
            let Some(conversation_id) = conversation_id.filter(|id| !id.is_empty()) else {
                messenger.send(ServerEvent::error("Missing conversation_id"));
                return;
            };
            let Some(index) = user_message_index else {
                messenger.send(ServerEvent::error("Missing user_message_index"));
                return;
            };
            let new_content = new_content.trim().to_string();
            if new_content.is_empty() {
                messenger.send(ServerEvent::error("Missing new_content"));
                return;
            }
            info!("Received edit request: conversation {}, user message {}", conversation_id, index);
            orchestrator.spawn_edit(conversation_id, index, new_content);
        }
        ClientMessage::StopStream { conversation_id } => {
            info!("Received stop_stream for conversation: {:?}", conversation_id);
            orchestrator.stop();
            messenger.send(ServerEvent::AssistantComplete);
        }
        ClientMessage::UpdateSettings { .. } => {
            info!("Received update_settings via WebSocket");
            orchestrator.send_ready("Settings updated successfully");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentFactory;
    use crate::conversation::MemoryConversationRepository;
    use crate::gateway::RecordingMessenger;
    use crate::mcp::testing::StaticLauncher;
    use crate::mcp::McpPoolManager;
    use crate::settings::{Settings, SettingsStore};

    fn orchestrator(messenger: Arc<RecordingMessenger>) -> Arc<ConversationOrchestrator> {
        let settings = Arc::new(SettingsStore::in_memory(Settings {
            mcp_servers: Default::default(),
            ..Settings::default()
        }));
        let services = ChatServices {
            repository: Arc::new(MemoryConversationRepository::new()),
            agents: Arc::new(AgentFactory::with_model(Arc::new(crate::agent::ScriptedModel::echo()))),
            pool: McpPoolManager::new(settings.clone(), Arc::new(StaticLauncher::new())),
            settings,
        };
        ConversationOrchestrator::new(messenger, services)
    }

    #[tokio::test]
    async fn test_invalid_json_reports_error() {
        let messenger = Arc::new(RecordingMessenger::new());
        let orch = orchestrator(messenger.clone());
        dispatch(&orch, messenger.as_ref(), "{not json");
        assert_eq!(messenger.events(), vec![ServerEvent::error("Invalid JSON format")]);
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored() {
        let messenger = Arc::new(RecordingMessenger::new());
        let orch = orchestrator(messenger.clone());
        dispatch(&orch, messenger.as_ref(), r#"{"type":"ping"}"#);
        assert!(messenger.events().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_known_type_reports_format_error() {
        let messenger = Arc::new(RecordingMessenger::new());
        let orch = orchestrator(messenger.clone());
        dispatch(&orch, messenger.as_ref(), r#"{"type":"approval_response","approved":true}"#);
        let events = messenger.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::Error { message } => assert!(message.starts_with("Invalid message format: ")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(orch.approvals().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let messenger = Arc::new(RecordingMessenger::new());
        let orch = orchestrator(messenger.clone());
        dispatch(&orch, messenger.as_ref(), r#"{"type":"chat_message","content":"hi"}"#);
        dispatch(&orch, messenger.as_ref(), r#"{"type":"edit_user_message","conversation_id":"c1","new_content":"x"}"#);
        dispatch(
            &orch,
            messenger.as_ref(),
            r#"{"type":"edit_user_message","conversation_id":"c1","user_message_index":0,"new_content":"  "}"#,
        );
        assert_eq!(
            messenger.events(),
            vec![
                ServerEvent::error("Missing conversation_id"),
                ServerEvent::error("Missing user_message_index"),
                ServerEvent::error("Missing new_content"),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_chat_message_is_dropped() {
        let messenger = Arc::new(RecordingMessenger::new());
        let orch = orchestrator(messenger.clone());
        dispatch(&orch, messenger.as_ref(), r#"{"type":"chat_message","content":"   ","conversation_id":"c1"}"#);
        orch.cleanup().await;
        assert!(messenger.events().is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_update_settings_acknowledged() {
        let messenger = Arc::new(RecordingMessenger::new());
        let orch = orchestrator(messenger.clone());
        dispatch(&orch, messenger.as_ref(), r#"{"type":"stop_stream","conversation_id":"c1"}"#);
        dispatch(&orch, messenger.as_ref(), r#"{"type":"update_settings","settings":{}}"#);
        assert_eq!(
            messenger.events(),
            vec![
                ServerEvent::AssistantComplete,
                ServerEvent::system_ready("Settings updated successfully"),
            ]
        );
    }
}
