/// 检查点接口

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use crate::app_state::AppState;

/// 历史查询参数
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub days: Option<i64>,
}

/// 清理参数
#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    #[serde(default = "default_days_to_keep")]
    pub days_to_keep: i64,
}

fn default_days_to_keep() -> i64 {
    30
}

/// 回滚请求
#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub removed: usize,
}

/// 创建路由
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_checkpoints))
        .route("/cleanup", post(cleanup_checkpoints))
        .route("/:checkpoint_id", get(get_checkpoint))
        .route("/:checkpoint_id/confirm", post(confirm_checkpoint))
        .route("/:checkpoint_id/rollback", post(rollback_checkpoint))
}

/// 检查点历史（最新的在前）
async fn list_checkpoints(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let history = state.service().history(query.days).await?;
    Ok(Json(history))
}

/// 获取单个检查点
async fn get_checkpoint(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let checkpoint = state.service().checkpoint(&checkpoint_id).await?;
    Ok(Json(checkpoint.summary()))
}

/// 确认变更
async fn confirm_checkpoint(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let checkpoint = state.service().confirm(&checkpoint_id).await?;
    Ok(Json(checkpoint.summary()))
}

/// 手动回滚
async fn rollback_checkpoint(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<String>,
    body: Option<Json<RollbackRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "手动回滚".to_string());
    let checkpoint = state.service().rollback(&checkpoint_id, &reason).await?;
    Ok(Json(checkpoint.summary()))
}

/// 清理旧检查点
async fn cleanup_checkpoints(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state.service().cleanup(query.days_to_keep).await?;
    Ok(Json(CleanupResponse { removed }))
}
