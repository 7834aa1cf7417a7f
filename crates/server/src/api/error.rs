/// API 错误响应
///
/// 把 `common::Error` 映射为状态码与结构化 JSON：
/// 400 校验类，409 冲突与检查点状态，404 未找到，502 远端执行，500 其他。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::error;

#[derive(Debug)]
pub struct ApiError(pub common::Error);

impl From<common::Error> for ApiError {
    fn from(err: common::Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        use common::Error::*;

        match &self.0 {
            Validation { .. } | NetworkTopology { .. } => StatusCode::BAD_REQUEST,
            Conflict { .. } | CheckpointState { .. } => StatusCode::CONFLICT,
            NotFound(_) => StatusCode::NOT_FOUND,
            RemoteStep { .. } | Ssh(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> Value {
        use common::Error::*;

        match &self.0 {
            Validation { field, .. } | Conflict { field, .. } | NetworkTopology { field, .. } => {
                json!({ "field": field })
            }
            CheckpointState { checkpoint_id, state } => {
                json!({ "checkpoint_id": checkpoint_id, "state": state })
            }
            RemoteStep {
                index,
                command,
                exit_status,
                output,
            } => json!({
                "step": index,
                "command": command,
                "exit_status": exit_status,
                "output": output,
            }),
            _ => Value::Null,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("请求处理失败: {}", self.0);
        }

        let body = Json(json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
            "detail": self.detail(),
        }));

        (status, body).into_response()
    }
}
