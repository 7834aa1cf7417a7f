/// 部署接口

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use agent::remote::{ApplyTarget, RemoteTarget};
use agent::GeneratedArtifacts;
use common::models::DeploymentRequest;

use super::error::ApiError;
use crate::app_state::AppState;

/// 执行部署请求；`ssh` 为空时在本机执行
#[derive(Debug, Deserialize)]
pub struct ApplyDeploymentRequest {
    pub deployment: DeploymentRequest,
    pub ssh: Option<RemoteTarget>,
}

/// 生成结果
#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    #[serde(flatten)]
    pub artifacts: GeneratedArtifacts,
    /// 已写入的文件
    pub files: Vec<String>,
}

/// 只校验不落盘
#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    pub warnings: Vec<String>,
}

/// 创建路由
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/validate", post(validate_deployment))
        .route("/generate", post(generate_deployment))
        .route("/apply", post(apply_deployment))
        .route("/:name/descriptor", get(get_descriptor))
        .route("/:name/checkpoint", get(get_active_checkpoint))
}

/// 校验部署请求，错误按统一格式返回，通过时附带提示
async fn validate_deployment(
    State(state): State<AppState>,
    Json(request): Json<DeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let artifacts = state.service().generate(&request)?;
    Ok(Json(ValidateResponse {
        valid: true,
        warnings: artifacts.warnings,
    }))
}

/// 生成服务描述与配套文件
async fn generate_deployment(
    State(state): State<AppState>,
    Json(request): Json<DeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.service();
    let artifacts = service.generate(&request)?;
    let files = service
        .write_artifacts(&artifacts)
        .await?
        .into_iter()
        .map(|p| p.display().to_string())
        .collect();

    Ok(Json(GenerateResponse { artifacts, files }))
}

/// 执行部署
async fn apply_deployment(
    State(state): State<AppState>,
    Json(body): Json<ApplyDeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let target = match body.ssh {
        Some(remote) => ApplyTarget::Remote(remote),
        None => ApplyTarget::Local,
    };
    let receipt = state.service().apply(&body.deployment, target).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// 获取当前生效的服务描述（只读）
async fn get_descriptor(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let descriptor = state
        .service()
        .descriptor_snapshot(&name)
        .await
        .ok_or_else(|| common::Error::NotFound(format!("部署 {}", name)))?;
    Ok(Json(descriptor))
}

/// 获取部署当前未决的检查点（包括执行失败后留下的）
async fn get_active_checkpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let checkpoint = state
        .service()
        .active_checkpoint(&name)
        .await
        .ok_or_else(|| common::Error::NotFound(format!("部署 {} 的未决检查点", name)))?;
    Ok(Json(checkpoint.summary()))
}
