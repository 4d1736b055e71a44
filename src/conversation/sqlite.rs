//! SQLite 对话存储
//!
//! 每个对话一行：messages / usage_stats 以 JSON 存储，时间戳为 RFC 3339。

#![cfg(feature = "async-sqlite")]

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::message::{Conversation, ConversationSummary, Message, Usage};
use super::repository::{ConversationRepository, RepositoryError};

pub struct SqliteConversationRepository {
    pool: SqlitePool,
}

impl SqliteConversationRepository {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let repo = Self { pool };
        repo.init_tables().await?;
        Ok(repo)
    }

    async fn init_tables(&self) -> Result<(), RepositoryError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                messages TEXT NOT NULL,
                usage_stats TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_conversation(row: &SqliteRow) -> Result<Conversation, RepositoryError> {
        let messages: String = row.get("messages");
        let usage: String = row.get("usage_stats");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");

        Ok(Conversation {
            conversation_id: row.get("conversation_id"),
            messages: serde_json::from_str(&messages)?,
            usage: serde_json::from_str(&usage)?,
            created_at: parse_timestamp(&created_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Database(format!("bad timestamp '{}': {}", s, e)))
}

#[async_trait]
impl ConversationRepository for SqliteConversationRepository {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(
            "SELECT conversation_id, messages, usage_stats, created_at, updated_at
             FROM conversations WHERE conversation_id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_conversation).transpose()
    }

    async fn save_new(&self, id: &str, messages: &[Message], usage: &Usage) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO conversations
             (conversation_id, messages, usage_stats, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(serde_json::to_string(messages)?)
        .bind(serde_json::to_string(usage)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::AlreadyExists(id.to_string()));
        }
        Ok(())
    }

    async fn update(&self, id: &str, messages: &[Message], usage: &Usage) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE conversations SET messages = ?, usage_stats = ?, updated_at = ?
             WHERE conversation_id = ?",
        )
        .bind(serde_json::to_string(messages)?)
        .bind(serde_json::to_string(usage)?)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM conversations WHERE conversation_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ConversationSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT conversation_id, messages, usage_stats, created_at, updated_at
             FROM conversations ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Self::row_to_conversation(row).map(|c| c.summary()))
            .collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// SQLite 的 LIMIT 为 i64，负数表示不限；超出范围时取上限
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_conversation_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("conversations.db");

        let repo = SqliteConversationRepository::new(&db_path).await.unwrap();
        let usage = Usage {
            total_tokens: 30,
            request_tokens: 20,
            response_tokens: 10,
            requests: 1,
        };
        repo.save_new("c1", &[Message::user("Hello"), Message::assistant("Hi!")], &usage)
            .await
            .unwrap();
        assert!(matches!(
            repo.save_new("c1", &[], &usage).await,
            Err(RepositoryError::AlreadyExists(_))
        ));
        repo.close().await;

        let repo2 = SqliteConversationRepository::new(&db_path).await.unwrap();
        let conv = repo2.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(conv.messages, vec![Message::user("Hello"), Message::assistant("Hi!")]);
        assert_eq!(conv.usage, usage);

        let summaries = repo2.list_recent(10).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].message_count, 2);
        assert_eq!(summaries[0].preview, "Hello");
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let repo = SqliteConversationRepository::new(temp_dir.path().join("c.db"))
            .await
            .unwrap();

        assert!(matches!(
            repo.update("missing", &[], &Usage::default()).await,
            Err(RepositoryError::NotFound(_))
        ));

        repo.save_new("c1", &[Message::user("one")], &Usage::default()).await.unwrap();
        repo.update("c1", &[Message::user("two")], &Usage { requests: 3, ..Default::default() })
            .await
            .unwrap();
        let conv = repo.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(conv.messages, vec![Message::user("two")]);
        assert_eq!(conv.usage.requests, 3);

        assert!(repo.delete("c1").await.unwrap());
        assert!(!repo.delete("c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_recent_limits() {
        let temp_dir = TempDir::new().unwrap();
        let repo = SqliteConversationRepository::new(temp_dir.path().join("l.db"))
            .await
            .unwrap();
        for id in ["a", "b", "c"] {
            repo.save_new(id, &[Message::user(id)], &Usage::default()).await.unwrap();
        }

        assert_eq!(repo.list_recent(2).await.unwrap().len(), 2);
        assert_eq!(repo.list_recent(0).await.unwrap().len(), 0);
        assert_eq!(repo.list_recent(usize::MAX).await.unwrap().len(), 3);
    }

    #[test]
    fn test_sql_limit_saturates() {
        assert_eq!(sql_limit(10), 10);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }
}
