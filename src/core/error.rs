//! 错误类型：Agent 执行错误与一次对话动作（chat / edit）的错误
//!
//! `ChatError` 是 Orchestrator 层的汇总错误；`Cancelled` 与 `StreamAborted` 单独列出，
//! 前者不是失败（静默结束），后者表示错误事件已由 StreamTranslator 发出、不可再报一次。

use thiserror::Error;

use crate::conversation::RepositoryError;
use crate::settings::SettingsError;

/// Agent 执行（模型请求 + 工具调用循环）过程中的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Network timeout")]
    NetworkTimeout,

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Missing API key for provider {provider} (set {env_var} or llm_provider.config.api_key)")]
    MissingApiKey { provider: String, env_var: String },

    #[error("Step limit reached: {0}")]
    StepLimitReached(usize),

    #[error("Execution cancelled")]
    Cancelled,

    /// 执行结果在流未耗尽前被读取
    #[error("Execution not finished")]
    NotFinished,
}

/// 一次对话动作的错误
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Conversation not found")]
    ConversationNotFound(String),

    #[error("User message at index {0} not found")]
    UserMessageNotFound(usize),

    #[error("Invalid attachment: {0}")]
    InvalidAttachment(String),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// 翻译中止，error 事件已发出
    #[error("Stream aborted: {0}")]
    StreamAborted(String),

    #[error("Cancelled")]
    Cancelled,
}

impl ChatError {
    /// 是否需要由 Orchestrator 再向客户端发出 error 事件
    pub fn is_reportable(&self) -> bool {
        !matches!(
            self,
            ChatError::Cancelled | ChatError::StreamAborted(_) | ChatError::Agent(AgentError::Cancelled)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_and_aborted_not_reportable() {
        assert!(!ChatError::Cancelled.is_reportable());
        assert!(!ChatError::StreamAborted("boom".into()).is_reportable());
        assert!(ChatError::UserMessageNotFound(3).is_reportable());
        assert!(!ChatError::from(AgentError::Cancelled).is_reportable());
        assert!(ChatError::from(AgentError::LlmError("401".into())).is_reportable());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ChatError::UserMessageNotFound(1).to_string(),
            "User message at index 1 not found"
        );
        assert_eq!(
            ChatError::ConversationNotFound("c1".into()).to_string(),
            "Conversation not found"
        );
    }
}
