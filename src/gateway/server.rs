//! HTTP 服务：路由与启动

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;

use super::api;
use super::orchestrator::ChatServices;
use super::websocket::ws_handler;

/// 路由共享状态
pub struct AppState {
    pub services: ChatServices,
}

impl AppState {
    pub fn new(services: ChatServices) -> Arc<Self> {
        Arc::new(Self { services })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route(
            "/api/conversations",
            get(api::list_conversations).post(api::create_conversation),
        )
        .route(
            "/api/conversations/:id",
            get(api::get_conversation).delete(api::delete_conversation),
        )
        .route("/api/settings", get(api::get_settings).put(api::update_settings))
        .route("/api/settings/validate-mcp", post(api::validate_mcp))
        .route("/api/mcp-servers/states", get(api::server_states))
        .route("/api/mcp-servers/toggle", post(api::toggle_server))
        .route("/api/mcp-servers/restart", post(api::restart_servers))
        .route("/health", get(api::health))
        .with_state(state)
}

/// 绑定并服务，直到 `shutdown` 被取消
pub async fn serve(state: Arc<AppState>, bind_addr: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", bind_addr, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{} (WebSocket: ws://{}/ws)", addr, addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
