//! 会话编排集成测试：脚本化模型 + 进程内工具服务 + 内存存储

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcp_chat::agent::{AgentFactory, ModelEvent, ScriptedModel};
use mcp_chat::conversation::{
    Conversation, ConversationRepository, ConversationSummary, MemoryConversationRepository,
    Message, RepositoryError, ToolOutcome, Usage,
};
use mcp_chat::gateway::{ChatServices, ConversationOrchestrator, RecordingMessenger, ServerEvent};
use mcp_chat::mcp::testing::StaticLauncher;
use mcp_chat::mcp::McpPoolManager;
use mcp_chat::settings::{McpServerConfig, Settings, SettingsStore};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// 记录写入次数的存储包装
#[derive(Default)]
struct CountingRepository {
    inner: MemoryConversationRepository,
    saves: AtomicUsize,
    updates: AtomicUsize,
}

impl CountingRepository {
    fn writes(&self) -> (usize, usize) {
        (self.saves.load(Ordering::SeqCst), self.updates.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl ConversationRepository for CountingRepository {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, RepositoryError> {
        self.inner.get_conversation(id).await
    }

    async fn save_new(&self, id: &str, messages: &[Message], usage: &Usage) -> Result<(), RepositoryError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save_new(id, messages, usage).await
    }

    async fn update(&self, id: &str, messages: &[Message], usage: &Usage) -> Result<(), RepositoryError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update(id, messages, usage).await
    }

    async fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        self.inner.delete(id).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ConversationSummary>, RepositoryError> {
        self.inner.list_recent(limit).await
    }
}

struct Harness {
    orchestrator: Arc<ConversationOrchestrator>,
    messenger: Arc<RecordingMessenger>,
    repository: Arc<CountingRepository>,
    launcher: Arc<StaticLauncher>,
}

async fn harness(model: ScriptedModel) -> Harness {
    harness_with(Arc::new(model)).await
}

/// 一个名为 "files" 的工具服务，提供 read_file / write_file
async fn harness_with(model: Arc<ScriptedModel>) -> Harness {
    let mut mcp_servers = BTreeMap::new();
    mcp_servers.insert(
        "files".to_string(),
        McpServerConfig::new("static", vec!["read_file".into(), "write_file".into()]),
    );
    let settings = Arc::new(SettingsStore::in_memory(Settings {
        mcp_servers,
        approval_timeout: 5.0,
        ..Settings::default()
    }));

    let launcher = Arc::new(StaticLauncher::new());
    let pool = McpPoolManager::new(settings.clone(), launcher.clone());
    pool.initialize().await.unwrap();

    let repository = Arc::new(CountingRepository::default());
    let messenger = Arc::new(RecordingMessenger::new());
    let services = ChatServices {
        repository: repository.clone(),
        agents: Arc::new(AgentFactory::with_model(model)),
        pool,
        settings,
    };
    Harness {
        orchestrator: ConversationOrchestrator::new(messenger.clone(), services),
        messenger,
        repository,
        launcher,
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn tool_call(id: &str, name: &str, args: serde_json::Value) -> ModelEvent {
    ModelEvent::ToolCall {
        tool_call_id: id.into(),
        tool_name: name.into(),
        args,
    }
}

fn text(content: &str) -> ModelEvent {
    ModelEvent::TextDelta {
        content: content.into(),
    }
}

#[tokio::test]
async fn test_new_then_continued_conversation() {
    let h = harness(ScriptedModel::echo()).await;
    let cancel = CancellationToken::new();

    h.orchestrator
        .handle_chat_message("hello", "conv-1", &[], &cancel)
        .await
        .unwrap();
    assert_eq!(h.repository.writes(), (1, 0));
    assert_eq!(
        h.messenger.events(),
        vec![
            ServerEvent::AssistantStart,
            ServerEvent::TextDelta {
                content: "Echo: hello".into()
            },
            ServerEvent::AssistantComplete,
        ]
    );

    h.orchestrator
        .handle_chat_message("again", "conv-1", &[], &cancel)
        .await
        .unwrap();
    assert_eq!(h.repository.writes(), (1, 1));

    let stored = h.repository.get_conversation("conv-1").await.unwrap().unwrap();
    assert_eq!(
        stored.messages,
        vec![
            Message::user("hello"),
            Message::assistant("Echo: hello"),
            Message::user("again"),
            Message::assistant("Echo: again"),
        ]
    );
    // 用量取最近一次执行的值，不与已存值相加
    assert_eq!(stored.usage.requests, 1);
    assert_eq!(stored.usage.total_tokens, 2);
}

#[tokio::test]
async fn test_one_tool_approved_one_denied() {
    let model = ScriptedModel::new(vec![
        vec![
            tool_call("c1", "read_file", json!({"path": "a.txt"})),
            tool_call("c2", "write_file", json!({"path": "b.txt"})),
        ],
        vec![text("done")],
    ]);
    let h = harness(model).await;

    let task = {
        let orchestrator = h.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .handle_chat_message("touch files", "conv-2", &[], &CancellationToken::new())
                .await
        })
    };

    let approval_requests = |messenger: &RecordingMessenger| -> Vec<(String, String)> {
        messenger
            .events()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::ApprovalRequest {
                    approval_id,
                    tool_name,
                    ..
                } => Some((approval_id, tool_name)),
                _ => None,
            })
            .collect()
    };
    wait_until(|| approval_requests(&h.messenger).len() == 2).await;
    for (approval_id, tool_name) in approval_requests(&h.messenger) {
        h.orchestrator
            .handle_approval_response(&approval_id, tool_name == "read_file");
    }
    task.await.unwrap().unwrap();

    let events = h.messenger.events();
    assert!(events.contains(&ServerEvent::ToolComplete {
        tool_id: "c1".into(),
        tool_name: "read_file".into(),
        content: r#"read_file: {"path":"a.txt"}"#.into(),
    }));
    assert!(events.contains(&ServerEvent::ToolBlocked {
        tool_id: "c2".into(),
        tool_name: "write_file".into(),
    }));
    assert_eq!(events.last(), Some(&ServerEvent::AssistantComplete));
    assert!(!events.iter().any(|e| matches!(e, ServerEvent::Error { .. })));

    // 被拒绝的工具不会真正执行
    let calls = h.launcher.launched()[0].calls();
    assert_eq!(calls, vec![("read_file".to_string(), json!({"path": "a.txt"}))]);

    let stored = h.repository.get_conversation("conv-2").await.unwrap().unwrap();
    let outcomes: Vec<(String, ToolOutcome)> = stored
        .messages
        .iter()
        .filter_map(|m| match m {
            Message::ToolResult {
                tool_call_id,
                outcome,
                ..
            } => Some((tool_call_id.clone(), *outcome)),
            _ => None,
        })
        .collect();
    assert!(outcomes.contains(&("c1".to_string(), ToolOutcome::Success)));
    assert!(outcomes.contains(&("c2".to_string(), ToolOutcome::Blocked)));
    assert_eq!(stored.messages.last(), Some(&Message::assistant("done")));
}

#[tokio::test]
async fn test_edit_truncates_and_regenerates() {
    let model = Arc::new(ScriptedModel::echo());
    let h = harness_with(model.clone()).await;
    h.repository
        .save_new(
            "conv-3",
            &[
                Message::user("u0"),
                Message::assistant("a0"),
                Message::user("u1"),
                Message::assistant("a1"),
                Message::user("u2"),
            ],
            &Usage {
                total_tokens: 1000,
                request_tokens: 900,
                response_tokens: 100,
                requests: 5,
            },
        )
        .await
        .unwrap();

    h.orchestrator
        .handle_edit_message("conv-3", 1, "new text", &CancellationToken::new())
        .await
        .unwrap();

    // 模型只看到编辑点之前的历史加上新内容
    let requests = model.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].messages,
        vec![Message::user("u0"), Message::assistant("a0"), Message::user("new text")]
    );

    let stored = h.repository.get_conversation("conv-3").await.unwrap().unwrap();
    assert_eq!(
        stored.messages,
        vec![
            Message::user("u0"),
            Message::assistant("a0"),
            Message::user("new text"),
            Message::assistant("Echo: new text"),
        ]
    );
    assert_eq!(
        stored.usage,
        Usage {
            total_tokens: 3,
            request_tokens: 0,
            response_tokens: 3,
            requests: 1,
        }
    );
    assert_eq!(h.repository.writes(), (1, 1));
}

#[tokio::test]
async fn test_edit_errors_are_reported_without_writes() {
    let h = harness(ScriptedModel::echo()).await;
    let cancel = CancellationToken::new();
    h.repository
        .save_new("conv-4", &[Message::user("only"), Message::assistant("Echo: only")], &Usage::default())
        .await
        .unwrap();

    assert!(h
        .orchestrator
        .handle_edit_message("missing", 0, "x", &cancel)
        .await
        .is_err());
    assert!(h
        .orchestrator
        .handle_edit_message("conv-4", 3, "x", &cancel)
        .await
        .is_err());

    assert_eq!(
        h.messenger.events(),
        vec![
            ServerEvent::error("Conversation not found"),
            ServerEvent::error("User message at index 3 not found"),
        ]
    );
    assert_eq!(h.repository.writes(), (1, 0));
}

#[tokio::test]
async fn test_stop_cancels_without_persisting() {
    let h = harness(ScriptedModel::new(vec![vec![text("partial")]]).hanging()).await;

    h.orchestrator
        .spawn_chat("long task".into(), "conv-5".into(), Vec::new());
    wait_until(|| {
        h.messenger
            .events()
            .iter()
            .any(|e| matches!(e, ServerEvent::TextDelta { .. }))
    })
    .await;

    assert_eq!(h.orchestrator.stop(), 1);
    h.orchestrator.cleanup().await;

    assert_eq!(h.repository.writes(), (0, 0));
    assert!(!h
        .messenger
        .events()
        .iter()
        .any(|e| matches!(e, ServerEvent::Error { .. })));
    assert!(h.repository.get_conversation("conv-5").await.unwrap().is_none());
}
