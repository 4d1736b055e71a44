//! REST 接口：对话管理、设置、MCP 服务状态

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::server::AppState;
use crate::conversation::Usage;
use crate::settings::{validate_server, McpServerConfig, Settings, SettingsError};

type ApiResult = Result<Json<Value>, (StatusCode, String)>;

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

/// GET /api/conversations?limit=N
pub async fn list_conversations(State(state): State<Arc<AppState>>, Query(query): Query<ListQuery>) -> ApiResult {
    let conversations = state
        .services
        .repository
        .list_recent(query.limit)
        .await
        .map_err(|e| {
            error!("Error listing conversations: {}", e);
            internal(e)
        })?;
    Ok(Json(json!({"status": "success", "conversations": conversations})))
}

/// GET /api/conversations/:id
pub async fn get_conversation(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let conversation = state
        .services
        .repository
        .get_conversation(&id)
        .await
        .map_err(internal)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Conversation {} not found", id)))?;
    Ok(Json(json!({"status": "success", "conversation": conversation})))
}

/// DELETE /api/conversations/:id
pub async fn delete_conversation(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let existed = state.services.repository.delete(&id).await.map_err(internal)?;
    if !existed {
        return Err((StatusCode::NOT_FOUND, format!("Conversation {} not found", id)));
    }
    info!("Deleted conversation {}", id);
    Ok(Json(json!({"status": "success", "message": format!("Conversation {} deleted", id)})))
}

/// POST /api/conversations：创建一个空对话
pub async fn create_conversation(State(state): State<Arc<AppState>>) -> ApiResult {
    let id = uuid::Uuid::new_v4().to_string();
    state
        .services
        .repository
        .save_new(&id, &[], &Usage::default())
        .await
        .map_err(internal)?;
    Ok(Json(json!({"conversation_id": id})))
}

/// GET /api/settings
pub async fn get_settings(State(state): State<Arc<AppState>>) -> ApiResult {
    let settings = state.services.settings.load().await.map_err(|e| {
        error!("Settings error: {}", e);
        internal(e)
    })?;
    Ok(Json(json!({"status": "success", "settings": settings})))
}

/// PUT /api/settings
///
/// 校验失败 400；观察者失败（如 MCP 服务重启失败并已回滚）500，此时设置已恢复为旧值。
pub async fn update_settings(State(state): State<Arc<AppState>>, Json(new_settings): Json<Settings>) -> ApiResult {
    match state.services.settings.save(new_settings).await {
        Ok(changed) => Ok(Json(json!({
            "status": "success",
            "message": "Settings updated successfully",
            "changed_keys": changed,
        }))),
        Err(SettingsError::Validation(problems)) => Err((StatusCode::BAD_REQUEST, problems.join("; "))),
        Err(e) => {
            error!("Error updating settings: {}", e);
            Err(internal(e))
        }
    }
}

/// POST /api/settings/validate-mcp：只校验，不保存
pub async fn validate_mcp(Json(servers): Json<std::collections::BTreeMap<String, McpServerConfig>>) -> ApiResult {
    let errors: Vec<String> = servers
        .iter()
        .flat_map(|(name, config)| validate_server(name, config))
        .collect();
    Ok(Json(json!({"status": "success", "valid": errors.is_empty(), "errors": errors})))
}

/// GET /api/mcp-servers/states
pub async fn server_states(State(state): State<Arc<AppState>>) -> ApiResult {
    let states = state.services.pool.get_server_states().await;
    Ok(Json(json!({"status": "success", "servers": states})))
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub server_name: Option<String>,
    pub enabled: Option<bool>,
}

/// POST /api/mcp-servers/toggle
pub async fn toggle_server(State(state): State<Arc<AppState>>, Json(request): Json<ToggleRequest>) -> ApiResult {
    let (Some(name), Some(enabled)) = (request.server_name, request.enabled) else {
        return Err((StatusCode::BAD_REQUEST, "Missing server_name or enabled parameter".to_string()));
    };
    if !state.services.pool.toggle_server(&name, enabled).await {
        return Err((StatusCode::NOT_FOUND, format!("Server '{}' is not configured", name)));
    }
    let verb = if enabled { "enabled" } else { "disabled" };
    Ok(Json(json!({"status": "success", "message": format!("Server '{}' {} successfully", name, verb)})))
}

/// POST /api/mcp-servers/restart
pub async fn restart_servers(State(state): State<Arc<AppState>>) -> ApiResult {
    state.services.pool.restart_servers().await.map_err(|e| {
        error!("Manual MCP restart failed: {}", e);
        internal(e)
    })?;
    Ok(Json(json!({"status": "success", "message": "MCP servers restarted"})))
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let servers = state.services.pool.health_check().await;
    Json(json!({
        "status": "ok",
        "mcp_initialized": state.services.pool.is_initialized(),
        "servers": servers,
    }))
}
