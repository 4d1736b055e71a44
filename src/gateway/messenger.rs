//! 出站事件通道
//!
//! `Messenger` 是会话向客户端推送事件的唯一出口；发送失败（连接已断开）只记日志，不向上传播。

use std::sync::Mutex;

use tokio::sync::mpsc;

use super::message::ServerEvent;

pub trait Messenger: Send + Sync {
    fn send(&self, event: ServerEvent);
}

/// 写入 WebSocket 写任务的通道
pub struct WebSocketMessenger {
    tx: mpsc::UnboundedSender<String>,
}

impl WebSocketMessenger {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl Messenger for WebSocketMessenger {
    fn send(&self, event: ServerEvent) {
        let kind = event.kind();
        match serde_json::to_string(&event) {
            Ok(json) => {
                if self.tx.send(json).is_err() {
                    tracing::debug!("Dropping {} event: connection closed", kind);
                }
            }
            Err(e) => tracing::error!("Failed to serialize {} event: {}", kind, e),
        }
    }
}

/// 记录所有事件（测试用）
#[derive(Default)]
pub struct RecordingMessenger {
    events: Mutex<Vec<ServerEvent>>,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// 事件类型序列
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(ServerEvent::kind).collect()
    }
}

impl Messenger for RecordingMessenger {
    fn send(&self, event: ServerEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
