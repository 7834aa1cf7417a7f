use thiserror::Error;

use crate::models::CheckpointState;

/// 统一错误类型
///
/// 校验类错误（Validation / Conflict / NetworkTopology）一律在任何副作用之前返回，
/// 每个变体都携带足够定位问题的结构化信息（字段名、步骤序号或检查点状态）。
#[derive(Error, Debug)]
pub enum Error {
    #[error("参数校验失败 [{field}]: {message}")]
    Validation { field: String, message: String },

    #[error("配置冲突 [{field}]: {message}")]
    Conflict { field: String, message: String },

    #[error("网络拓扑错误 [{field}]: {message}")]
    NetworkTopology { field: String, message: String },

    #[error("检查点 {checkpoint_id} 已处于 {state} 状态，无法再次处理")]
    CheckpointState {
        checkpoint_id: String,
        state: CheckpointState,
    },

    #[error("第 {index} 步执行失败 (exit={exit_status}): {command}\n{output}")]
    RemoteStep {
        index: usize,
        command: String,
        exit_status: i32,
        output: String,
    },

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("SSH 错误: {0}")]
    Ssh(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML 渲染错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn conflict(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn topology(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NetworkTopology {
            field: field.into(),
            message: message.into(),
        }
    }

    /// 请求本身有问题（调用方修正输入即可重试）
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::Conflict { .. } | Self::NetworkTopology { .. }
        )
    }

    /// 错误码，供 API 层输出
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Conflict { .. } => "CONFLICT_ERROR",
            Self::NetworkTopology { .. } => "NETWORK_TOPOLOGY_ERROR",
            Self::CheckpointState { .. } => "CHECKPOINT_STATE_ERROR",
            Self::RemoteStep { .. } => "REMOTE_STEP_FAILURE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Ssh(_) => "SSH_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Serialization(_) | Self::Yaml(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
