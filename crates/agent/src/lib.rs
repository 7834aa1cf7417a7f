/// DokWin Agent
///
/// Windows 容器部署核心：版本存储、网络规划、服务描述生成、本地/SSH 执行与检查点回滚。

pub mod checkpoint;
pub mod config;
pub mod descriptor;
pub mod network;
pub mod remote;
pub mod service;
pub mod storage;

pub use config::AgentConfig;
pub use service::{DeploymentService, GeneratedArtifacts, SessionOpener, TargetOpener};
