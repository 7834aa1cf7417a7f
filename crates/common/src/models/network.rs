use serde::{Deserialize, Serialize};

/// 网络规格
///
/// 每种模式只携带自己需要的字段。`segment_isolated` 的字段保持原始字符串，
/// 由网络规划器按固定顺序逐项校验并给出具体字段名。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NetworkSpec {
    /// Docker 默认网桥 + 端口映射
    #[default]
    Bridge,
    /// 共享宿主机网络栈
    Host,
    /// 专用网桥 + 固定地址
    Static(StaticSpec),
    /// macvlan：容器直接获得物理网段地址
    #[serde(alias = "macvlan")]
    SegmentIsolated(SegmentSpec),
    /// 不接入任何网络
    #[serde(rename = "none")]
    Disabled,
}

impl NetworkSpec {
    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Host => "host",
            Self::Static(_) => "static",
            Self::SegmentIsolated(_) => "segment_isolated",
            Self::Disabled => "none",
        }
    }

    /// 该模式下是否允许显式端口映射
    pub fn allows_port_mappings(&self) -> bool {
        !matches!(self, Self::Host | Self::Disabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticSpec {
    pub address: Option<String>,
    pub gateway: Option<String>,
    /// 前缀长度，缺省 /24
    #[serde(default)]
    pub prefix: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SegmentSpec {
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub ip_range: Option<String>,
    /// 宿主机物理接口
    #[serde(default)]
    pub parent: Option<String>,
    /// 容器固定地址
    #[serde(default)]
    pub address: Option<String>,
    /// 宿主机侧 shim 地址（可选）
    #[serde(default)]
    pub host_shim: Option<String>,
}
