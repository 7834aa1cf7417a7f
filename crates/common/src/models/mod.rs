/// 共享数据模型
///
/// 定义 Server 和 Agent 共享的数据结构：部署请求、网络规格、服务描述与检查点

mod checkpoint;
mod descriptor;
mod network;
mod request;

pub use checkpoint::*;
pub use descriptor::*;
pub use network::*;
pub use request::*;

/// 常量定义
pub mod constants {
    /// 默认 Server 端口
    pub const DEFAULT_SERVER_PORT: u16 = 3000;

    /// 默认镜像
    pub const DEFAULT_IMAGE: &str = "dockurr/windows:latest";

    /// 默认 RDP 端口
    pub const DEFAULT_RDP_PORT: u32 = 3389;

    /// 默认 VNC（Web 查看器）端口
    pub const DEFAULT_VNC_PORT: u32 = 8006;

    /// 容器内运行用户
    pub const DEFAULT_RUNTIME_UID: u32 = 1000;
    pub const DEFAULT_RUNTIME_GID: u32 = 1000;

    /// 默认停止宽限期
    pub const DEFAULT_STOP_GRACE_PERIOD: &str = "2m";

    /// 回滚超时允许范围（秒）
    pub const MIN_ROLLBACK_TIMEOUT: u64 = 30;
    pub const MAX_ROLLBACK_TIMEOUT: u64 = 3600;

    /// 容器内固定挂载点
    pub const STORAGE_MOUNT: &str = "/storage";
    pub const SHARED_MOUNT: &str = "/shared";
}
