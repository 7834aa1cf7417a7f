use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{NetworkObject, ServiceDescriptor};

/// 检查点状态
///
/// 只允许 pending → confirmed | rolled_back | expired，且只发生一次。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Pending,
    Confirmed,
    RolledBack,
    /// 已超时，但自动回滚未能完成
    Expired,
}

impl CheckpointState {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for CheckpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::RolledBack => "rolled_back",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// 监控方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringMode {
    /// 仅等待截止时间
    #[default]
    Timer,
    /// 周期性探测外部连通性
    Connectivity,
    /// 周期性检查容器运行与健康状态
    ContainerHealth,
}

/// 变更类型，决定默认超时
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Container,
    Network,
    SegmentNetwork,
    System,
}

impl ChangeKind {
    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            Self::Container => 180,
            Self::Network => 300,
            Self::SegmentNetwork => 420,
            Self::System => 600,
        }
    }
}

/// 变更前快照，创建后不可修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    /// 变更前的描述（首次部署时为空）
    pub prior_descriptor: Option<ServiceDescriptor>,
    /// 变更前的网络对象
    pub prior_networks: Vec<NetworkObject>,
    /// 本次受保护的描述
    pub applied: ServiceDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub deployment: String,
    pub created_at: DateTime<Utc>,
    pub timeout_secs: u64,
    pub monitoring: MonitoringMode,
    pub change_kind: ChangeKind,
    pub state: CheckpointState,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// 回滚原因或失败信息
    #[serde(default)]
    pub note: Option<String>,
    pub snapshot: CheckpointSnapshot,
}

impl Checkpoint {
    pub fn deadline(&self) -> DateTime<Utc> {
        self.created_at + chrono::Duration::seconds(self.timeout_secs as i64)
    }

    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            id: self.id.clone(),
            deployment: self.deployment.clone(),
            created_at: self.created_at,
            timeout_secs: self.timeout_secs,
            monitoring: self.monitoring,
            change_kind: self.change_kind,
            state: self.state,
            resolved_at: self.resolved_at,
            note: self.note.clone(),
        }
    }
}

/// 不含快照的检查点概要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub id: String,
    pub deployment: String,
    pub created_at: DateTime<Utc>,
    pub timeout_secs: u64,
    pub monitoring: MonitoringMode,
    pub change_kind: ChangeKind,
    pub state: CheckpointState,
    pub resolved_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

/// 回滚记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub checkpoint_id: String,
    pub reason: String,
    pub automatic: bool,
    pub success: bool,
    pub error: Option<String>,
    pub rolled_back_at: DateTime<Utc>,
}

/// 返回给调用方的确认契约
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReceipt {
    pub deployment: String,
    /// 未启用回滚时为空
    pub checkpoint_id: Option<String>,
    pub timeout_secs: Option<u64>,
    pub monitoring: Option<MonitoringMode>,
    pub steps_executed: usize,
}
