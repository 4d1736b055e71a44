//! 会话编排器：一次 chat / edit 动作的唯一入口
//!
//! 每个 WebSocket 连接一个实例。动作在 SessionSupervisor 跟踪的后台任务中执行，
//! 会话锁保证同一连接上的动作串行；审批应答不经过该锁。
//!
//! 流程：加载历史 → 启动执行 → StreamTranslator 推送事件 → 成功后持久化（新建或整体替换）。
//! 取消静默结束且不写入；其他错误只向客户端报告一次。

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::message::{ImageAttachment, ServerEvent};
use super::messenger::Messenger;
use crate::agent::{AgentRunner, ExecutionRequest, ExecutionResult, ModelSpec, UserContent};
use crate::approval::{ApprovalGate, ApprovalInterceptor};
use crate::conversation::{user_message_position, ConversationRepository, Message, UserPart};
use crate::core::{ChatError, SessionSupervisor};
use crate::mcp::McpPoolManager;
use crate::settings::SettingsStore;
use crate::stream::StreamTranslator;

/// 跨会话共享的服务
#[derive(Clone)]
pub struct ChatServices {
    pub repository: Arc<dyn ConversationRepository>,
    pub agents: Arc<dyn AgentRunner>,
    pub pool: Arc<McpPoolManager>,
    pub settings: Arc<SettingsStore>,
}

pub struct ConversationOrchestrator {
    messenger: Arc<dyn Messenger>,
    services: ChatServices,
    approvals: Arc<ApprovalGate>,
    message_lock: Mutex<()>,
    supervisor: SessionSupervisor,
}

impl ConversationOrchestrator {
    pub fn new(messenger: Arc<dyn Messenger>, services: ChatServices) -> Arc<Self> {
        let approvals = Arc::new(ApprovalGate::new(messenger.clone(), services.settings.clone()));
        Arc::new(Self {
            messenger,
            services,
            approvals,
            message_lock: Mutex::new(()),
            supervisor: SessionSupervisor::new(),
        })
    }

    pub fn approvals(&self) -> &Arc<ApprovalGate> {
        &self.approvals
    }

    /// 在后台任务中处理一条聊天消息
    pub fn spawn_chat(self: &Arc<Self>, content: String, conversation_id: String, images: Vec<ImageAttachment>) {
        let this = Arc::clone(self);
        self.supervisor.spawn("chat_message", move |cancel| async move {
            if let Err(e) = this
                .handle_chat_message(&content, &conversation_id, &images, &cancel)
                .await
            {
                debug!("Chat action for {} ended: {}", conversation_id, e);
            }
        });
    }

    /// 在后台任务中处理一次编辑
    pub fn spawn_edit(self: &Arc<Self>, conversation_id: String, user_message_index: usize, new_content: String) {
        let this = Arc::clone(self);
        self.supervisor.spawn("edit_user_message", move |cancel| async move {
            if let Err(e) = this
                .handle_edit_message(&conversation_id, user_message_index, &new_content, &cancel)
                .await
            {
                debug!("Edit action for {} ended: {}", conversation_id, e);
            }
        });
    }

    /// 处理聊天消息；错误在返回前已按需上报给客户端
    pub async fn handle_chat_message(
        &self,
        text: &str,
        conversation_id: &str,
        images: &[ImageAttachment],
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        let outcome = self.chat(text, conversation_id, images, cancel).await;
        self.report(outcome, "Error processing message")
    }

    /// 编辑第 `user_message_index` 条用户消息并从该处重新生成
    pub async fn handle_edit_message(
        &self,
        conversation_id: &str,
        user_message_index: usize,
        new_content: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        let outcome = self.edit(conversation_id, user_message_index, new_content, cancel).await;
        self.report(outcome, "Error processing edit")
    }

    pub fn handle_approval_response(&self, approval_id: &str, approved: bool) {
        self.approvals.resolve_approval(approval_id, approved);
    }

    /// stop_stream：取消当前所有动作，会话继续可用
    pub fn stop(&self) -> usize {
        let cancelled = self.supervisor.cancel_all();
        info!("Stop requested, cancelled {} task(s)", cancelled);
        cancelled
    }

    /// 会话结束：取消并等待所有后台任务
    pub async fn cleanup(&self) {
        self.supervisor.shutdown().await;
        info!("Conversation orchestrator cleanup completed");
    }

    pub fn send_ready(&self, message: &str) {
        self.messenger.send(ServerEvent::system_ready(message));
    }

    async fn chat(
        &self,
        text: &str,
        conversation_id: &str,
        images: &[ImageAttachment],
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        let _guard = self.lock_session(cancel).await?;

        let history = match self.services.repository.get_conversation(conversation_id).await? {
            Some(conversation) => {
                info!(
                    "Continuing conversation {} with {} messages",
                    conversation_id,
                    conversation.messages.len()
                );
                conversation.messages
            }
            None => {
                info!("Starting new conversation {}", conversation_id);
                Vec::new()
            }
        };

        let input = prepare_user_content(text, images)?;
        self.execute(conversation_id, history, input, cancel).await
    }

    async fn edit(
        &self,
        conversation_id: &str,
        user_message_index: usize,
        new_content: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        let _guard = self.lock_session(cancel).await?;

        let conversation = self
            .services
            .repository
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::ConversationNotFound(conversation_id.to_string()))?;
        let position = user_message_position(&conversation.messages, user_message_index)
            .ok_or(ChatError::UserMessageNotFound(user_message_index))?;

        let mut history = conversation.messages;
        history.truncate(position);
        info!(
            "Editing conversation {}: truncated to {} messages before user message {}",
            conversation_id,
            history.len(),
            user_message_index
        );
        self.execute(conversation_id, history, UserContent::Text(new_content.to_string()), cancel)
            .await
    }

    async fn lock_session(&self, cancel: &CancellationToken) -> Result<tokio::sync::MutexGuard<'_, ()>, ChatError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ChatError::Cancelled),
            guard = self.message_lock.lock() => Ok(guard),
        }
    }

    async fn execute(
        &self,
        conversation_id: &str,
        history: Vec<Message>,
        input: UserContent,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        let settings = self.services.settings.load().await?;
        let servers = self.services.pool.get_enabled_servers().await;
        let interceptor = Arc::new(ApprovalInterceptor::new(self.approvals.clone(), cancel.clone()));

        let request = ExecutionRequest {
            input,
            history,
            servers,
            interceptor,
            system_prompt: settings.system_prompt.clone(),
            model: ModelSpec {
                provider: settings.llm_provider.provider.clone(),
                model: settings.llm_provider.model.clone(),
                config: settings.llm_provider.config.clone(),
                model_settings: settings.llm_provider.model_settings.clone(),
                enable_thinking: settings.enable_thinking,
            },
            cancel: cancel.clone(),
        };

        let mut execution = self.services.agents.start(request).await?;
        StreamTranslator::new(self.messenger.clone())
            .translate(execution.as_mut(), cancel)
            .await?;
        let result = execution.finish().await?;

        // 取消后不再写入
        if cancel.is_cancelled() {
            return Err(ChatError::Cancelled);
        }
        self.persist(conversation_id, result).await
    }

    async fn persist(&self, conversation_id: &str, result: ExecutionResult) -> Result<(), ChatError> {
        let repository = &self.services.repository;
        match repository.get_conversation(conversation_id).await? {
            // 用量整体覆盖：完整历史即权威
            Some(_) => {
                repository
                    .update(conversation_id, &result.messages, &result.usage)
                    .await?;
                info!(
                    "Updated conversation {} - Messages: {}, Usage: {} tokens",
                    conversation_id,
                    result.messages.len(),
                    result.usage.total_tokens
                );
            }
            None => {
                repository
                    .save_new(conversation_id, &result.messages, &result.usage)
                    .await?;
                info!(
                    "Saved new conversation {} - Messages: {}, Usage: {} tokens",
                    conversation_id,
                    result.messages.len(),
                    result.usage.total_tokens
                );
            }
        }
        Ok(())
    }

    fn report(&self, outcome: Result<(), ChatError>, prefix: &str) -> Result<(), ChatError> {
        if let Err(e) = &outcome {
            if e.is_reportable() {
                error!("{}: {}", prefix, e);
                let message = match e {
                    ChatError::ConversationNotFound(_) | ChatError::UserMessageNotFound(_) => e.to_string(),
                    _ => format!("{}: {}", prefix, e),
                };
                self.messenger.send(ServerEvent::error(message));
            }
        }
        outcome
    }
}

/// 文本 + 图片附件 → 执行输入；附件 base64 解码失败即整个动作失败
fn prepare_user_content(text: &str, images: &[ImageAttachment]) -> Result<UserContent, ChatError> {
    if images.is_empty() {
        return Ok(UserContent::Text(text.to_string()));
    }

    let mut parts = Vec::with_capacity(images.len() + 1);
    if !text.trim().is_empty() {
        parts.push(UserPart::Text { text: text.to_string() });
    }
    for image in images {
        let label = image.name.as_deref().unwrap_or("unknown");
        let data = BASE64
            .decode(image.data.trim())
            .map_err(|e| ChatError::InvalidAttachment(format!("{}: {}", label, e)))?;
        info!("Added image: {} ({}, {} bytes)", label, image.media_type, data.len());
        parts.push(UserPart::Binary {
            media_type: image.media_type.clone(),
            data,
            name: image.name.clone(),
        });
    }
    Ok(UserContent::Parts(parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_plain_text() {
        assert_eq!(
            prepare_user_content("hi", &[]).unwrap(),
            UserContent::Text("hi".into())
        );
    }

    #[test]
    fn test_prepare_images() {
        let images = vec![ImageAttachment {
            name: Some("a.png".into()),
            media_type: "image/png".into(),
            data: "AQID".into(),
        }];
        match prepare_user_content("  ", &images).unwrap() {
            UserContent::Parts(parts) => {
                assert_eq!(parts.len(), 1);
                assert!(matches!(&parts[0], UserPart::Binary { data, .. } if data == &vec![1, 2, 3]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_prepare_invalid_image() {
        let images = vec![ImageAttachment {
            name: None,
            media_type: "image/png".into(),
            data: "!!not base64!!".into(),
        }];
        assert!(matches!(
            prepare_user_content("look", &images),
            Err(ChatError::InvalidAttachment(_))
        ));
    }
}
