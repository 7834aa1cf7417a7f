/// 配置管理
///
/// 环境变量前缀 `DOKWIN_`，例如 `DOKWIN_STORAGE_ROOT=/srv/dokwin`

use std::path::PathBuf;

use serde::Deserialize;

use common::models::constants::{DEFAULT_IMAGE, DEFAULT_RUNTIME_GID, DEFAULT_RUNTIME_UID};

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Windows 容器镜像
    pub image: String,
    /// 版本隔离存储根目录
    pub storage_root: PathBuf,
    /// 生成产物输出目录
    pub output_dir: PathBuf,
    /// 检查点持久化目录
    pub checkpoint_dir: PathBuf,
    pub runtime_uid: u32,
    pub runtime_gid: u32,
    /// docker 可执行文件
    pub docker_bin: String,
    pub ssh_connect_timeout_secs: u64,
    /// 健康探测间隔
    pub probe_interval_secs: u64,
    /// 连续探测失败多少次触发自动回滚
    pub probe_failure_threshold: u32,
    /// macvlan 模式下等待容器启动的上限
    pub segment_ready_timeout_secs: u64,
}

impl AgentConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        let cfg = ::config::Config::builder()
            .set_default("image", DEFAULT_IMAGE)?
            .set_default("storage_root", "/var/lib/dokwin/storage")?
            .set_default("output_dir", "./output")?
            .set_default("checkpoint_dir", "/var/lib/dokwin/checkpoints")?
            .set_default("runtime_uid", DEFAULT_RUNTIME_UID as i64)?
            .set_default("runtime_gid", DEFAULT_RUNTIME_GID as i64)?
            .set_default("docker_bin", "docker")?
            .set_default("ssh_connect_timeout_secs", 10i64)?
            .set_default("probe_interval_secs", 5i64)?
            .set_default("probe_failure_threshold", 3i64)?
            .set_default("segment_ready_timeout_secs", 120i64)?
            .add_source(::config::Environment::with_prefix("DOKWIN").try_parsing(true))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            storage_root: PathBuf::from("/var/lib/dokwin/storage"),
            output_dir: PathBuf::from("./output"),
            checkpoint_dir: PathBuf::from("/var/lib/dokwin/checkpoints"),
            runtime_uid: DEFAULT_RUNTIME_UID,
            runtime_gid: DEFAULT_RUNTIME_GID,
            docker_bin: "docker".to_string(),
            ssh_connect_timeout_secs: 10,
            probe_interval_secs: 5,
            probe_failure_threshold: 3,
            segment_ready_timeout_secs: 120,
        }
    }
}
