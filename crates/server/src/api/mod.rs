pub mod checkpoints;
pub mod deployments;
pub mod error;

use axum::Router;

use crate::app_state::AppState;

/// 所有 API 路由（统一入口）
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/deployments", deployments::routes())
        .nest("/checkpoints", checkpoints::routes())
}
