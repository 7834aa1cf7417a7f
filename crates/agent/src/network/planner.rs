/// 网络规划
///
/// 每个部署只有一个网络计划：按 NetworkSpec 变体分别校验，
/// 产出网络接入方式、需要预创建的网络对象以及可选的 host shim。
/// 所有校验都在生成任何产物之前完成。

use std::net::Ipv4Addr;

use common::models::{
    DeploymentRequest, HostShim, NetworkAttachment, NetworkDriver, NetworkObject, NetworkSpec,
    SegmentSpec, StaticSpec,
};
use common::utils::{is_safe_interface_name, Ipv4Cidr};
use common::{Error, Result};
use tracing::{debug, info, warn};

use super::procedure::SetupProcedure;

const DEFAULT_STATIC_PREFIX: u8 = 24;

/// 两阶段接入时的引导网络
pub const BOOTSTRAP_NETWORK: &str = "bridge";

/// 网络计划
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPlan {
    pub attachment: NetworkAttachment,
    pub networks: Vec<NetworkObject>,
    pub host_shim: Option<HostShim>,
}

impl NetworkPlan {
    pub fn setup_procedure(&self, docker_bin: &str) -> SetupProcedure {
        SetupProcedure::build(docker_bin, &self.networks, self.host_shim.as_ref())
    }

    /// 是否需要发布端口映射
    pub fn publishes_ports(&self) -> bool {
        !matches!(
            self.attachment,
            NetworkAttachment::Host | NetworkAttachment::Disabled
        )
    }
}

pub fn static_network_name(deployment: &str) -> String {
    format!("dokwin-{}-net", deployment)
}

pub fn segment_network_name(deployment: &str) -> String {
    format!("dokwin-{}-macvlan", deployment)
}

/// shim 接口名：`dws-` + 名称哈希前 10 位，共 14 个字符，不同部署互不冲突
pub fn shim_interface_name(deployment: &str) -> String {
    let hash = blake3::hash(deployment.as_bytes()).to_hex();
    format!("dws-{}", &hash.as_str()[..10])
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkPlanner;

impl NetworkPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn plan(&self, request: &DeploymentRequest) -> Result<NetworkPlan> {
        let name = request.name.as_str();
        debug!("规划网络: {} (mode={})", name, request.network.mode_name());

        let plan = match &request.network {
            NetworkSpec::Bridge => NetworkPlan {
                attachment: NetworkAttachment::Bridge,
                networks: Vec::new(),
                host_shim: None,
            },
            NetworkSpec::Host | NetworkSpec::Disabled => {
                if request.has_explicit_ports() {
                    let field = if request.rdp_port.is_some() {
                        "rdp_port"
                    } else {
                        "vnc_port"
                    };
                    return Err(Error::topology(
                        field,
                        format!("{} 模式不允许显式端口映射", request.network.mode_name()),
                    ));
                }
                let attachment = if matches!(request.network, NetworkSpec::Host) {
                    NetworkAttachment::Host
                } else {
                    NetworkAttachment::Disabled
                };
                NetworkPlan {
                    attachment,
                    networks: Vec::new(),
                    host_shim: None,
                }
            }
            NetworkSpec::Static(spec) => plan_static(name, spec)?,
            NetworkSpec::SegmentIsolated(spec) => plan_segment(name, spec)?,
        };

        info!(
            "网络计划完成: {} (mode={}, 网络对象 {} 个)",
            name,
            request.network.mode_name(),
            plan.networks.len()
        );
        Ok(plan)
    }
}

fn require<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::topology(field, "缺少必填字段")),
    }
}

fn parse_ip(value: &str, field: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| Error::topology(field, format!("无效的 IP 地址: {}", value)))
}

fn parse_cidr(value: &str, field: &str) -> Result<Ipv4Cidr> {
    value.parse().map_err(|e: String| Error::topology(field, e))
}

fn plan_static(name: &str, spec: &StaticSpec) -> Result<NetworkPlan> {
    let address = parse_ip(require(&spec.address, "network.address")?, "network.address")?;
    let gateway = parse_ip(require(&spec.gateway, "network.gateway")?, "network.gateway")?;
    let prefix = spec.prefix.unwrap_or(DEFAULT_STATIC_PREFIX);

    if !(8..=30).contains(&prefix) {
        return Err(Error::topology(
            "network.prefix",
            format!("前缀长度 {} 超出范围 8-30", prefix),
        ));
    }

    let subnet = Ipv4Cidr::containing(address, prefix)
        .ok_or_else(|| Error::topology("network.prefix", "无效的前缀长度"))?;

    if !subnet.contains(gateway) {
        return Err(Error::topology(
            "network.gateway",
            format!("网关 {} 不在子网 {} 内", gateway, subnet),
        ));
    }
    if gateway == address {
        return Err(Error::topology("network.gateway", "网关不能与容器地址相同"));
    }
    if address == subnet.network() {
        return Err(Error::topology(
            "network.address",
            format!("{} 是网络地址，不能分配给容器", address),
        ));
    }

    let network = static_network_name(name);
    Ok(NetworkPlan {
        attachment: NetworkAttachment::Static {
            network: network.clone(),
            address: address.to_string(),
            gateway: gateway.to_string(),
            subnet: subnet.to_string(),
        },
        networks: vec![NetworkObject {
            name: network,
            driver: NetworkDriver::Bridge,
            subnet: subnet.to_string(),
            gateway: gateway.to_string(),
            ip_range: None,
            parent: None,
        }],
        host_shim: None,
    })
}

fn plan_segment(name: &str, spec: &SegmentSpec) -> Result<NetworkPlan> {
    // 固定顺序逐项校验，遇到第一个问题即返回
    let subnet = parse_cidr(require(&spec.subnet, "network.subnet")?, "network.subnet")?;
    let gateway = parse_ip(require(&spec.gateway, "network.gateway")?, "network.gateway")?;
    let ip_range = parse_cidr(require(&spec.ip_range, "network.ip_range")?, "network.ip_range")?;

    let parent = require(&spec.parent, "network.parent")?;
    if !is_safe_interface_name(parent) {
        return Err(Error::topology(
            "network.parent",
            format!("接口名 {} 含非法字符或超过 15 个字符", parent),
        ));
    }

    let address = parse_ip(require(&spec.address, "network.address")?, "network.address")?;

    let shim_address = match spec.host_shim.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Some(parse_ip(v, "network.host_shim")?),
        _ => None,
    };

    if !subnet.contains(gateway) {
        return Err(Error::topology(
            "network.gateway",
            format!("网关 {} 不在子网 {} 内", gateway, subnet),
        ));
    }
    if !subnet.contains(address) {
        return Err(Error::topology(
            "network.address",
            format!("地址 {} 不在子网 {} 内", address, subnet),
        ));
    }
    if address == gateway {
        return Err(Error::topology("network.address", "容器地址不能与网关相同"));
    }
    if !subnet.contains(ip_range.network()) {
        // 只告警，不强制 ip_range ⊆ subnet
        warn!("ip_range {} 不在子网 {} 内，Docker 可能拒绝创建网络", ip_range, subnet);
    }

    let network = segment_network_name(name);
    let host_shim = shim_address.map(|shim| HostShim {
        interface: shim_interface_name(name),
        parent: parent.to_string(),
        address: format!("{}/32", shim),
        route: ip_range.to_string(),
    });

    Ok(NetworkPlan {
        attachment: NetworkAttachment::Segment {
            bootstrap: BOOTSTRAP_NETWORK.to_string(),
            network: network.clone(),
            address: address.to_string(),
        },
        networks: vec![NetworkObject {
            name: network,
            driver: NetworkDriver::Macvlan,
            subnet: subnet.to_string(),
            gateway: gateway.to_string(),
            ip_range: Some(ip_range.to_string()),
            parent: Some(parent.to_string()),
        }],
        host_shim,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(network: serde_json::Value) -> DeploymentRequest {
        serde_json::from_value(serde_json::json!({
            "name": "t1",
            "version": "11",
            "credentials": { "username": "Docker", "password": "admin12345" },
            "resources": { "cpu_cores": 2, "ram_gb": 4, "disk_gb": 64 },
            "network": network
        }))
        .unwrap()
    }

    fn segment_json() -> serde_json::Value {
        serde_json::json!({
            "mode": "segment_isolated",
            "subnet": "10.0.0.0/24",
            "gateway": "10.0.0.1",
            "ip_range": "10.0.0.192/29",
            "parent": "eth0",
            "address": "10.0.0.193"
        })
    }

    fn topology_field(result: Result<NetworkPlan>) -> String {
        match result {
            Err(Error::NetworkTopology { field, .. }) => field,
            other => panic!("expected topology error, got {:?}", other),
        }
    }

    #[test]
    fn test_static_address_and_gateway_in_subnet() {
        for (addr, gw, prefix) in [
            ("192.168.1.50", "192.168.1.1", None),
            ("10.20.30.40", "10.20.0.1", Some(16)),
            ("172.16.5.9", "172.16.5.14", Some(28)),
        ] {
            let req = request(serde_json::json!({
                "mode": "static", "address": addr, "gateway": gw, "prefix": prefix
            }));
            let plan = NetworkPlanner::new().plan(&req).unwrap();
            match &plan.attachment {
                NetworkAttachment::Static {
                    network,
                    address,
                    gateway,
                    subnet,
                } => {
                    let cidr: Ipv4Cidr = subnet.parse().unwrap();
                    assert!(cidr.contains(address.parse().unwrap()));
                    assert!(cidr.contains(gateway.parse().unwrap()));
                    assert_eq!(network, "dokwin-t1-net");
                    assert_eq!(plan.networks[0].subnet, *subnet);
                }
                other => panic!("unexpected attachment {:?}", other),
            }
        }
    }

    #[test]
    fn test_static_gateway_outside_subnet() {
        let req = request(serde_json::json!({
            "mode": "static", "address": "192.168.1.50", "gateway": "192.168.2.1"
        }));
        assert_eq!(topology_field(NetworkPlanner::new().plan(&req)), "network.gateway");

        let req = request(serde_json::json!({
            "mode": "static", "address": "192.168.1.1", "gateway": "192.168.1.1"
        }));
        assert_eq!(topology_field(NetworkPlanner::new().plan(&req)), "network.gateway");
    }

    #[test]
    fn test_static_requires_address() {
        let req = request(serde_json::json!({ "mode": "static", "gateway": "192.168.1.1" }));
        assert_eq!(topology_field(NetworkPlanner::new().plan(&req)), "network.address");
    }

    #[test]
    fn test_segment_missing_fields() {
        for field in ["subnet", "gateway", "ip_range", "parent"] {
            let mut spec = segment_json();
            spec.as_object_mut().unwrap().remove(field);
            let req = request(spec);
            assert_eq!(
                topology_field(NetworkPlanner::new().plan(&req)),
                format!("network.{}", field)
            );
        }
    }

    #[test]
    fn test_segment_first_malformed_field_wins() {
        let mut spec = segment_json();
        spec["gateway"] = serde_json::json!("10.0.0");
        spec["parent"] = serde_json::json!("eth0;reboot");
        assert_eq!(topology_field(NetworkPlanner::new().plan(&request(spec))), "network.gateway");

        let mut spec = segment_json();
        spec["parent"] = serde_json::json!("eth0 && reboot");
        assert_eq!(topology_field(NetworkPlanner::new().plan(&request(spec))), "network.parent");

        let mut spec = segment_json();
        spec["host_shim"] = serde_json::json!("not-an-ip");
        assert_eq!(topology_field(NetworkPlanner::new().plan(&request(spec))), "network.host_shim");
    }

    #[test]
    fn test_segment_plan_is_two_phase() {
        let plan = NetworkPlanner::new().plan(&request(segment_json())).unwrap();
        assert_eq!(
            plan.attachment,
            NetworkAttachment::Segment {
                bootstrap: "bridge".to_string(),
                network: "dokwin-t1-macvlan".to_string(),
                address: "10.0.0.193".to_string(),
            }
        );
        assert_eq!(plan.networks[0].driver, NetworkDriver::Macvlan);
        assert!(plan.host_shim.is_none());
        assert!(plan.publishes_ports());
    }

    #[test]
    fn test_ip_range_outside_subnet_is_permitted() {
        let mut spec = segment_json();
        spec["ip_range"] = serde_json::json!("10.9.0.0/29");
        assert!(NetworkPlanner::new().plan(&request(spec)).is_ok());
    }

    #[test]
    fn test_host_shim_planned() {
        let mut spec = segment_json();
        spec["host_shim"] = serde_json::json!("10.0.0.254");
        let plan = NetworkPlanner::new().plan(&request(spec)).unwrap();
        let shim = plan.host_shim.clone().unwrap();
        assert_eq!(shim.interface, shim_interface_name("t1"));
        assert_eq!(shim.address, "10.0.0.254/32");
        assert_eq!(shim.route, "10.0.0.192/29");
        assert_eq!(plan.setup_procedure("docker").shim_steps.len(), 4);
    }

    #[test]
    fn test_host_mode_rejects_explicit_ports() {
        let mut req = request(serde_json::json!({ "mode": "host" }));
        assert!(!NetworkPlanner::new().plan(&req).unwrap().publishes_ports());

        req.vnc_port = Some(8006);
        assert_eq!(topology_field(NetworkPlanner::new().plan(&req)), "vnc_port");
    }

    #[test]
    fn test_shim_name_length() {
        assert!(shim_interface_name("a-very-long-deployment-name").len() <= 15);
        assert!(is_safe_interface_name(&shim_interface_name("x_y-z")));
    }

    #[test]
    fn test_shim_names_do_not_collide() {
        let a = shim_interface_name("branch-office-1");
        let b = shim_interface_name("branch-office-2");
        assert_ne!(a, b);
        assert_ne!(shim_interface_name("a.b"), shim_interface_name("ab"));
        assert_eq!(a, shim_interface_name("branch-office-1"));
        assert!(a.len() <= 15 && b.len() <= 15);
        assert!(is_safe_interface_name(&a));
    }
}
