//! 工具调用审批
//!
//! `ApprovalGate` 按会话持有待审批表：请求审批时先登记 oneshot 槽位再推送 `approval_request`，
//! 然后等待客户端应答、超时或取消三者之一。超时、取消、槽位丢失一律视为拒绝。
//! `ApprovalInterceptor` 把审批挂到 Agent 的每一次工具调用上。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{ToolCallFuture, ToolInterceptor};
use crate::conversation::{TOOL_DENIED_RESULT, TOOL_ERROR_PREFIX};
use crate::gateway::{Messenger, ServerEvent};
use crate::settings::SettingsStore;

pub struct ApprovalGate {
    messenger: Arc<dyn Messenger>,
    settings: Arc<SettingsStore>,
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

/// 离开作用域时移除槽位（应答、超时、取消或 future 被丢弃都会走到这里）
struct PendingGuard<'a> {
    gate: &'a ApprovalGate,
    approval_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.gate.pending.lock() {
            pending.remove(&self.approval_id);
        }
    }
}

impl ApprovalGate {
    pub fn new(messenger: Arc<dyn Messenger>, settings: Arc<SettingsStore>) -> Self {
        Self {
            messenger,
            settings,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// 请求审批；返回是否批准
    ///
    /// 开启自动审批时直接返回 true，不推送任何事件。
    pub async fn request_approval(&self, tool_name: &str, args: &Value, cancel: &CancellationToken) -> bool {
        if self.settings.auto_approve_tools().await {
            debug!("Auto-approving tool '{}'", tool_name);
            return true;
        }
        let timeout = self.settings.approval_timeout().await;

        let approval_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        match self.pending.lock() {
            Ok(mut pending) => {
                pending.insert(approval_id.clone(), tx);
            }
            Err(_) => {
                warn!("Approval table poisoned, denying '{}'", tool_name);
                return false;
            }
        }
        let _guard = PendingGuard {
            gate: self,
            approval_id: approval_id.clone(),
        };

        self.messenger.send(ServerEvent::ApprovalRequest {
            approval_id: approval_id.clone(),
            tool_name: tool_name.to_string(),
            args: args.clone(),
        });
        info!("Waiting for approval {} (tool: {}, timeout: {:?})", approval_id, tool_name, timeout);

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Approval {} cancelled", approval_id);
                false
            }
            result = tokio::time::timeout(timeout, rx) => match result {
                Ok(Ok(approved)) => approved,
                Ok(Err(_)) => {
                    warn!("Approval {} dropped without answer", approval_id);
                    false
                }
                Err(_) => {
                    warn!("Approval {} timed out after {:?}", approval_id, timeout);
                    false
                }
            }
        }
    }

    /// 客户端应答；未知或已结束的 id 只记警告
    pub fn resolve_approval(&self, approval_id: &str, approved: bool) {
        let sender = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(approval_id));
        match sender {
            Some(tx) => {
                if tx.send(approved).is_err() {
                    warn!("Approval {} no longer awaited", approval_id);
                }
            }
            None => warn!("Received response for unknown approval_id: {}", approval_id),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

/// 每次工具调用前请求审批；工具错误转为 "Error occurred: ..." 文本
pub struct ApprovalInterceptor {
    gate: Arc<ApprovalGate>,
    cancel: CancellationToken,
}

impl ApprovalInterceptor {
    pub fn new(gate: Arc<ApprovalGate>, cancel: CancellationToken) -> Self {
        Self { gate, cancel }
    }
}

impl ToolInterceptor for ApprovalInterceptor {
    fn intercept<'a>(
        &'a self,
        tool_name: &'a str,
        args: &'a Value,
        call: ToolCallFuture<'a>,
    ) -> BoxFuture<'a, String> {
        Box::pin(async move {
            if !self.gate.request_approval(tool_name, args, &self.cancel).await {
                return TOOL_DENIED_RESULT.to_string();
            }
            match call.await {
                Ok(output) => output,
                Err(e) => {
                    warn!("Tool '{}' failed: {}", tool_name, e);
                    format!("{}{}", TOOL_ERROR_PREFIX, e)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::RecordingMessenger;
    use crate::mcp::McpError;
    use crate::settings::Settings;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn gate_with(auto_approve: bool, timeout_secs: f64) -> (Arc<ApprovalGate>, Arc<RecordingMessenger>) {
        let settings = Settings {
            auto_approve_tools: auto_approve,
            approval_timeout: timeout_secs,
            ..Settings::default()
        };
        let messenger = Arc::new(RecordingMessenger::new());
        let gate = Arc::new(ApprovalGate::new(
            messenger.clone(),
            Arc::new(SettingsStore::in_memory(settings)),
        ));
        (gate, messenger)
    }

    fn approval_id(messenger: &RecordingMessenger) -> Option<String> {
        messenger.events().into_iter().find_map(|e| match e {
            ServerEvent::ApprovalRequest { approval_id, .. } => Some(approval_id),
            _ => None,
        })
    }

    async fn wait_for_request(messenger: &RecordingMessenger) -> String {
        for _ in 0..100 {
            if let Some(id) = approval_id(messenger) {
                return id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no approval_request emitted");
    }

    #[tokio::test]
    async fn test_auto_approve_emits_nothing() {
        let (gate, messenger) = gate_with(true, 60.0);
        assert!(gate.request_approval("write", &json!({}), &CancellationToken::new()).await);
        assert!(messenger.events().is_empty());
    }

    #[tokio::test]
    async fn test_approved_response() {
        let (gate, messenger) = gate_with(false, 60.0);
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.request_approval("write", &json!({"p": 1}), &CancellationToken::new()).await })
        };
        let id = wait_for_request(&messenger).await;
        assert_eq!(gate.pending_count(), 1);
        gate.resolve_approval(&id, true);
        assert!(waiter.await.unwrap());
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_denied_response() {
        let (gate, messenger) = gate_with(false, 60.0);
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.request_approval("write", &json!({}), &CancellationToken::new()).await })
        };
        let id = wait_for_request(&messenger).await;
        gate.resolve_approval(&id, false);
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_denies_and_late_response_is_ignored() {
        let (gate, messenger) = gate_with(false, 0.2);
        let started = std::time::Instant::now();
        assert!(!gate.request_approval("write", &json!({}), &CancellationToken::new()).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "denied too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "denied too late: {:?}", elapsed);
        assert_eq!(gate.pending_count(), 0);

        // 超时后的应答：只记警告
        let id = approval_id(&messenger).unwrap();
        gate.resolve_approval(&id, true);
        gate.resolve_approval("never-issued", true);
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_denies() {
        let (gate, messenger) = gate_with(false, 60.0);
        let cancel = CancellationToken::new();
        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.request_approval("write", &json!({}), &cancel).await })
        };
        wait_for_request(&messenger).await;
        cancel.cancel();
        assert!(!waiter.await.unwrap());
        assert_eq!(gate.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_interceptor_denied_skips_call() {
        let (gate, _messenger) = gate_with(false, 0.05);
        let interceptor = ApprovalInterceptor::new(gate, CancellationToken::new());
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = invoked.clone();
        let args = json!({});
        let call: ToolCallFuture<'_> = Box::pin(async move {
            flag.store(true, Ordering::SeqCst);
            Ok("written".to_string())
        });
        let out = interceptor.intercept("write", &args, call).await;
        assert_eq!(out, TOOL_DENIED_RESULT);
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_interceptor_formats_tool_error() {
        let (gate, _messenger) = gate_with(true, 60.0);
        let interceptor = ApprovalInterceptor::new(gate, CancellationToken::new());
        let args = json!({});
        let call: ToolCallFuture<'_> = Box::pin(async {
            Err(McpError::ToolFailed {
                tool: "write".into(),
                message: "disk full".into(),
            })
        });
        let out = interceptor.intercept("write", &args, call).await;
        assert!(out.starts_with(TOOL_ERROR_PREFIX));
        assert!(out.contains("disk full"));
    }
}
