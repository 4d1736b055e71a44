//! 对话存储抽象层
//!
//! 定义统一的对话存储接口，支持内存和 SQLite 两种实现

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use super::message::{Conversation, ConversationSummary, Message, Usage};

#[cfg(feature = "async-sqlite")]
use super::sqlite::SqliteConversationRepository;

/// 对话存储错误
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Conversation already exists: {0}")]
    AlreadyExists(String),

    #[error("Conversation not found: {0}")]
    NotFound(String),
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        RepositoryError::Database(e.to_string())
    }
}

/// 对话存储接口
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// 获取对话，不存在时返回 None
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, RepositoryError>;

    /// 新建对话
    async fn save_new(&self, id: &str, messages: &[Message], usage: &Usage) -> Result<(), RepositoryError>;

    /// 整体替换已有对话的消息与用量
    async fn update(&self, id: &str, messages: &[Message], usage: &Usage) -> Result<(), RepositoryError>;

    /// 删除对话，返回是否存在
    async fn delete(&self, id: &str) -> Result<bool, RepositoryError>;

    /// 最近更新的对话摘要（updated_at 倒序）
    async fn list_recent(&self, limit: usize) -> Result<Vec<ConversationSummary>, RepositoryError>;

    /// 关闭底层连接
    async fn close(&self) {}
}

/// 内存对话存储
#[derive(Default)]
pub struct MemoryConversationRepository {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl MemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationRepository for MemoryConversationRepository {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self.conversations.read().await.get(id).cloned())
    }

    async fn save_new(&self, id: &str, messages: &[Message], usage: &Usage) -> Result<(), RepositoryError> {
        let mut conversations = self.conversations.write().await;
        if conversations.contains_key(id) {
            return Err(RepositoryError::AlreadyExists(id.to_string()));
        }
        let now = chrono::Utc::now();
        conversations.insert(
            id.to_string(),
            Conversation {
                conversation_id: id.to_string(),
                messages: messages.to_vec(),
                usage: *usage,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn update(&self, id: &str, messages: &[Message], usage: &Usage) -> Result<(), RepositoryError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        conversation.messages = messages.to_vec();
        conversation.usage = *usage;
        conversation.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        Ok(self.conversations.write().await.remove(id).is_some())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ConversationSummary>, RepositoryError> {
        let conversations = self.conversations.read().await;
        let mut summaries: Vec<ConversationSummary> =
            conversations.values().map(Conversation::summary).collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries.truncate(limit);
        Ok(summaries)
    }
}

/// 创建对话存储
///
/// 如果提供了 db_path 且启用了 async-sqlite feature，则使用 SQLite；否则使用内存存储
pub async fn create_conversation_repository(
    db_path: Option<&std::path::Path>,
) -> Arc<dyn ConversationRepository> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match SqliteConversationRepository::new(path).await {
            Ok(repo) => {
                tracing::info!("Using SQLite conversation repository: {:?}", path);
                return Arc::new(repo);
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite repository, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("SQLite repository requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory conversation repository");
    Arc::new(MemoryConversationRepository::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_new_then_update() {
        let repo = MemoryConversationRepository::new();
        let usage = Usage { requests: 1, ..Default::default() };
        repo.save_new("c1", &[Message::user("hi")], &usage).await.unwrap();

        assert!(matches!(
            repo.save_new("c1", &[], &usage).await,
            Err(RepositoryError::AlreadyExists(_))
        ));

        let replaced = Usage { requests: 2, total_tokens: 10, ..Default::default() };
        repo.update("c1", &[Message::user("hi"), Message::assistant("hello")], &replaced)
            .await
            .unwrap();

        let conv = repo.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.usage, replaced);
    }

    #[tokio::test]
    async fn test_update_missing_fails() {
        let repo = MemoryConversationRepository::new();
        assert!(matches!(
            repo.update("nope", &[], &Usage::default()).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_recent_and_delete() {
        let repo = MemoryConversationRepository::new();
        for id in ["a", "b", "c"] {
            repo.save_new(id, &[Message::user(format!("hello {}", id))], &Usage::default())
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let recent = repo.list_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].conversation_id, "c");
        assert_eq!(recent[0].preview, "hello c");

        assert!(repo.delete("c").await.unwrap());
        assert!(!repo.delete("c").await.unwrap());
        assert!(repo.get_conversation("c").await.unwrap().is_none());
    }
}
