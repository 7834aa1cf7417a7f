use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 声明式服务描述
///
/// 由描述生成器产出，之后只读地交给本地/远程执行方或顾问类消费者。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub service_name: String,
    pub container_name: String,
    pub image: String,
    /// 键唯一；保留键只能由生成器写入
    pub environment: BTreeMap<String, String>,
    pub devices: Vec<String>,
    pub capabilities: Vec<String>,
    pub volumes: Vec<VolumeMount>,
    pub ports: Vec<PortMapping>,
    /// 需要预先创建的网络对象
    pub networks: Vec<NetworkObject>,
    pub host_shim: Option<HostShim>,
    pub attachment: NetworkAttachment,
    pub health_check: Option<HealthCheck>,
    pub restart: RestartPolicy,
    pub stop_grace_period: String,
    pub limits: ResourceLimitsSpec,
}

impl ServiceDescriptor {
    pub fn env(&self, key: &str) -> Option<&str> {
        self.environment.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    /// `source:target[:ro]`
    pub fn to_spec(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    /// `host:container/proto`
    pub fn to_spec(&self) -> String {
        format!("{}:{}/{}", self.host, self.container, self.protocol.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkDriver {
    Bridge,
    Macvlan,
}

impl NetworkDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Macvlan => "macvlan",
        }
    }
}

/// 需要在宿主机上存在的 Docker 网络
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkObject {
    pub name: String,
    pub driver: NetworkDriver,
    pub subnet: String,
    pub gateway: String,
    #[serde(default)]
    pub ip_range: Option<String>,
    /// macvlan 绑定的物理接口
    #[serde(default)]
    pub parent: Option<String>,
}

/// 宿主机侧 macvlan shim 接口，让宿主机能访问隔离网段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostShim {
    pub interface: String,
    pub parent: String,
    /// 带前缀的地址，如 `10.0.0.254/32`
    pub address: String,
    /// 经由 shim 的路由目标
    pub route: String,
}

/// 容器的网络接入方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetworkAttachment {
    Bridge,
    Host,
    Disabled,
    Static {
        network: String,
        address: String,
        gateway: String,
        subnet: String,
    },
    /// 两阶段接入：先挂在 `bootstrap` 上启动，再切换到隔离网段
    Segment {
        bootstrap: String,
        network: String,
        address: String,
    },
}

impl NetworkAttachment {
    /// `docker run --network` 的取值；默认网桥返回 None
    pub fn run_network(&self) -> Option<&str> {
        match self {
            Self::Bridge => None,
            Self::Host => Some("host"),
            Self::Disabled => Some("none"),
            Self::Static { network, .. } => Some(network),
            Self::Segment { bootstrap, .. } => Some(bootstrap),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub test: Vec<String>,
    pub interval: String,
    pub timeout: String,
    pub retries: u32,
    pub start_period: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    OnFailure,
    UnlessStopped,
    Always,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::OnFailure => "on-failure",
            Self::UnlessStopped => "unless-stopped",
            Self::Always => "always",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimitsSpec {
    pub cpus: u32,
    pub memory_gb: u32,
}
