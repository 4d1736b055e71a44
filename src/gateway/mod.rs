//! 网关：WebSocket 协议、会话编排与 HTTP 接口
//!
//! - **message**: 客户端 / 服务端消息定义
//! - **messenger**: 出站事件通道
//! - **orchestrator**: 每个连接一个 ConversationOrchestrator
//! - **websocket**: 连接读循环与消息分发
//! - **api** / **server**: REST 路由与服务启动

pub mod api;
mod message;
mod messenger;
mod orchestrator;
mod server;
mod websocket;

pub use message::{ClientMessage, ImageAttachment, ServerEvent};
pub use messenger::{Messenger, RecordingMessenger, WebSocketMessenger};
pub use orchestrator::{ChatServices, ConversationOrchestrator};
pub use server::{build_router, serve, AppState};
pub use websocket::{handle_connection, ws_handler, READY_MESSAGE};
