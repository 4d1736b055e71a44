//! 端到端测试：真实 TCP 监听 + WebSocket 客户端 + REST 查询

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mcp_chat::agent::{AgentFactory, ScriptedModel};
use mcp_chat::conversation::{ConversationRepository, MemoryConversationRepository};
use mcp_chat::gateway::{build_router, AppState, ChatServices, ServerEvent, READY_MESSAGE};
use mcp_chat::mcp::testing::StaticLauncher;
use mcp_chat::mcp::McpPoolManager;
use mcp_chat::settings::{Settings, SettingsStore};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

type Client = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_server() -> (SocketAddr, Arc<MemoryConversationRepository>) {
    let settings = Arc::new(SettingsStore::in_memory(Settings {
        mcp_servers: Default::default(),
        ..Settings::default()
    }));
    let pool = McpPoolManager::new(settings.clone(), Arc::new(StaticLauncher::new()));
    pool.initialize().await.unwrap();

    let repository = Arc::new(MemoryConversationRepository::new());
    let state = AppState::new(ChatServices {
        repository: repository.clone(),
        agents: Arc::new(AgentFactory::with_model(Arc::new(ScriptedModel::echo()))),
        pool,
        settings,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    (addr, repository)
}

async fn next_event(client: &mut Client) -> ServerEvent {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for event")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn test_chat_over_websocket() {
    let (addr, repository) = start_server().await;
    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();

    assert_eq!(next_event(&mut client).await, ServerEvent::system_ready(READY_MESSAGE));

    send(
        &mut client,
        json!({"type": "chat_message", "content": "hi there", "conversation_id": "e2e-1"}),
    )
    .await;
    assert_eq!(next_event(&mut client).await, ServerEvent::AssistantStart);
    assert_eq!(
        next_event(&mut client).await,
        ServerEvent::TextDelta {
            content: "Echo: hi there".into()
        }
    );
    assert_eq!(next_event(&mut client).await, ServerEvent::AssistantComplete);

    // 持久化发生在 assistant_complete 之后
    let mut stored = None;
    for _ in 0..100 {
        stored = repository.get_conversation("e2e-1").await.unwrap();
        if stored.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stored = stored.expect("conversation was not persisted");
    assert_eq!(stored.messages.len(), 2);
    assert_eq!(stored.usage.requests, 1);

    let body: Value = reqwest::get(format!("http://{}/api/conversations/e2e-1", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["conversation"]["conversation_id"], "e2e-1");
}

#[tokio::test]
async fn test_protocol_errors_keep_connection_open() {
    let (addr, _) = start_server().await;
    let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();
    next_event(&mut client).await;

    client.send(Message::Text("{oops".into())).await.unwrap();
    assert_eq!(next_event(&mut client).await, ServerEvent::error("Invalid JSON format"));

    send(&mut client, json!({"type": "chat_message", "content": "hi"})).await;
    assert_eq!(next_event(&mut client).await, ServerEvent::error("Missing conversation_id"));

    send(&mut client, json!({"type": "stop_stream", "conversation_id": "x"})).await;
    assert_eq!(next_event(&mut client).await, ServerEvent::AssistantComplete);
}

#[tokio::test]
async fn test_rest_endpoints() {
    let (addr, _) = start_server().await;
    let http = reqwest::Client::new();

    let health: Value = http
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["mcp_initialized"], true);

    let missing = http
        .get(format!("http://{}/api/conversations/nope", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let toggle = http
        .post(format!("http://{}/api/mcp-servers/toggle", addr))
        .json(&json!({"server_name": "ghost", "enabled": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(toggle.status(), reqwest::StatusCode::NOT_FOUND);

    let created: Value = http
        .post(format!("http://{}/api/conversations", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["conversation_id"].as_str().unwrap().to_string();

    let listed: Value = http
        .get(format!("http://{}/api/conversations?limit=5", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["conversations"][0]["conversation_id"], id.as_str());
}
