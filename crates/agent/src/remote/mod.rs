/// 远程执行
///
/// 描述 → 命令计划的翻译，以及本地/SSH 两种命令会话

pub mod session;
pub mod ssh;
pub mod translator;

use std::time::Duration;

use common::Result;
use serde::{Deserialize, Serialize};

pub use session::{CommandOutput, CommandSession, LocalSession};
pub use ssh::{RemoteTarget, SshAuth, SshSession};
pub use translator::{PlanStep, RemoteCommandPlan, RemoteTranslator, StepResult};

/// 部署目标
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApplyTarget {
    Local,
    Remote(RemoteTarget),
}

impl ApplyTarget {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub fn runtime_endpoint(&self) -> Option<String> {
        match self {
            Self::Local => None,
            Self::Remote(target) => target.runtime_endpoint.clone(),
        }
    }

    /// 打开一个新会话
    pub async fn open(&self, connect_timeout: Duration) -> Result<Box<dyn CommandSession>> {
        match self {
            Self::Local => Ok(Box::new(LocalSession::new())),
            Self::Remote(target) => Ok(Box::new(SshSession::connect(target, connect_timeout).await?)),
        }
    }
}
