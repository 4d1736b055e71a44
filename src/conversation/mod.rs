//! 对话数据：消息模型、用量计数与存储（内存 / SQLite）

mod message;
mod repository;
#[cfg(feature = "async-sqlite")]
mod sqlite;

pub use message::{
    is_denied, preview_of, user_message_position, Conversation, ConversationSummary, Message,
    ToolOutcome, Usage, UserPart, EMPTY_TOOL_OUTPUT, TOOL_DENIED_RESULT, TOOL_ERROR_PREFIX,
};
pub use repository::{
    create_conversation_repository, ConversationRepository, MemoryConversationRepository,
    RepositoryError,
};
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteConversationRepository;
