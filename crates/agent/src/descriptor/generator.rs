/// 服务描述生成
///
/// 组合顺序：镜像/资源 → 设备 → 企业服务环境变量 → 存储挂载 → 网络接入 → 健康检查与重启策略。
/// 全部校验通过前不产生任何副作用。

use std::collections::BTreeMap;
use std::path::Path;

use common::models::constants::{DEFAULT_STOP_GRACE_PERIOD, SHARED_MOUNT, STORAGE_MOUNT};
use common::models::{
    DeploymentRequest, EnterpriseServices, HealthCheck, NetworkAttachment, PortMapping, Protocol,
    ResourceLimitsSpec, RestartPolicy, ServiceDescriptor, VolumeMount,
};
use common::utils::{is_valid_env_key, parse_grace_period, Ipv4Cidr};
use common::{Error, Result};
use tracing::{debug, info, warn};

use super::render;
use crate::network::NetworkPlan;
use crate::storage::normalize_version;

/// KVM 硬件加速
pub const KVM_DEVICE: &str = "/dev/kvm";
/// 启动期联网需要的 TUN 设备，与网络模式无关
pub const TUN_DEVICE: &str = "/dev/net/tun";

/// 保留环境变量表：只有生成器可以写入
#[derive(Debug, Clone)]
pub struct ReservedKeys {
    exact: Vec<&'static str>,
    prefixes: Vec<&'static str>,
}

impl ReservedKeys {
    pub fn standard() -> Self {
        Self {
            exact: vec![
                "VERSION", "USERNAME", "PASSWORD", "RAM_SIZE", "CPU_CORES", "DISK_SIZE",
                "LANGUAGE", "KEYBOARD", "KVM", "DEBUG", "DNS", "IP", "GATEWAY", "NETMASK",
            ],
            prefixes: vec!["SNMP_", "WMI_", "LOG_", "LOGGING_"],
        }
    }

    pub fn is_reserved(&self, key: &str) -> bool {
        self.exact.contains(&key) || self.prefixes.iter().any(|p| key.starts_with(p))
    }
}

/// 生成结果：描述 + 配套 `.env` 文本
#[derive(Debug, Clone)]
pub struct GeneratedDescriptor {
    pub descriptor: ServiceDescriptor,
    pub env_artifact: String,
    /// 不阻止部署的提示
    pub warnings: Vec<String>,
}

pub struct DescriptorGenerator {
    image: String,
    reserved: ReservedKeys,
}

impl DescriptorGenerator {
    pub fn new(image: impl Into<String>, reserved: ReservedKeys) -> Self {
        Self {
            image: image.into(),
            reserved,
        }
    }

    pub fn generate(
        &self,
        request: &DeploymentRequest,
        plan: &NetworkPlan,
        storage_path: &Path,
    ) -> Result<GeneratedDescriptor> {
        self.validate(request, plan)?;

        let warnings = advisories(request, plan);
        for warning in &warnings {
            warn!("部署 {}: {}", request.name, warning);
        }

        let mut environment = self.base_environment(request);
        static_address_env(&mut environment, &plan.attachment)?;
        merge_service_env(&mut environment, &request.services);
        for (key, value) in &request.extra_env {
            environment.insert(key.clone(), value.clone());
        }

        let stop_grace_period = request
            .stop_grace_period
            .clone()
            .unwrap_or_else(|| DEFAULT_STOP_GRACE_PERIOD.to_string());

        let descriptor = ServiceDescriptor {
            service_name: request.name.clone(),
            container_name: request.name.clone(),
            image: self.image.clone(),
            environment,
            devices: vec![KVM_DEVICE.to_string(), TUN_DEVICE.to_string()],
            capabilities: vec!["NET_ADMIN".to_string()],
            volumes: storage_mounts(request, storage_path),
            ports: if plan.publishes_ports() {
                port_mappings(request)
            } else {
                Vec::new()
            },
            networks: plan.networks.clone(),
            host_shim: plan.host_shim.clone(),
            attachment: plan.attachment.clone(),
            health_check: Some(default_health_check()),
            restart: RestartPolicy::OnFailure,
            stop_grace_period,
            limits: ResourceLimitsSpec {
                cpus: request.resources.cpu_cores,
                memory_gb: request.resources.ram_gb,
            },
        };

        let env_artifact = render::render_env_file(&descriptor);
        info!(
            "服务描述生成完成: {} (image={}, env {} 项, volume {} 个)",
            descriptor.service_name,
            descriptor.image,
            descriptor.environment.len(),
            descriptor.volumes.len()
        );

        Ok(GeneratedDescriptor {
            descriptor,
            env_artifact,
            warnings,
        })
    }

    fn validate(&self, request: &DeploymentRequest, plan: &NetworkPlan) -> Result<()> {
        request.check()?;

        if plan.publishes_ports() {
            let rdp = check_port(request.rdp_port(), "rdp_port")?;
            let vnc = check_port(request.vnc_port(), "vnc_port")?;
            if rdp == vnc {
                return Err(Error::conflict(
                    "vnc_port",
                    format!("RDP 与 VNC 端口相同: {}", rdp),
                ));
            }
        }

        validate_services(&request.services)?;

        for key in request.extra_env.keys() {
            let field = format!("extra_env.{}", key);
            if !is_valid_env_key(key) {
                return Err(Error::validation(field, "环境变量名只允许大写字母、数字和下划线"));
            }
            if self.reserved.is_reserved(key) {
                return Err(Error::conflict(field, "与保留环境变量冲突"));
            }
        }

        for (i, volume) in request.extra_volumes.iter().enumerate() {
            let target = volume.target.trim_end_matches('/');
            if target == STORAGE_MOUNT || target == SHARED_MOUNT {
                return Err(Error::conflict(
                    format!("extra_volumes[{}].target", i),
                    format!("{} 由生成器管理", volume.target),
                ));
            }
            if volume.source.is_empty() || !volume.target.starts_with('/') {
                return Err(Error::validation(
                    format!("extra_volumes[{}]", i),
                    "挂载源不能为空，目标必须是绝对路径",
                ));
            }
        }

        if let Some(grace) = &request.stop_grace_period {
            if parse_grace_period(grace).is_none() {
                return Err(Error::validation(
                    "stop_grace_period",
                    format!("无法解析的时长: {}（支持 2m / 45s / 10）", grace),
                ));
            }
        }

        if let Some(dns) = request.dns_servers.iter().find(|d| d.parse::<std::net::IpAddr>().is_err()) {
            return Err(Error::validation("dns_servers", format!("无效的 DNS 地址: {}", dns)));
        }

        Ok(())
    }

    fn base_environment(&self, request: &DeploymentRequest) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("VERSION".to_string(), normalize_version(&request.version));
        env.insert("USERNAME".to_string(), request.credentials.username.clone());
        env.insert("PASSWORD".to_string(), request.credentials.password.clone());
        env.insert("CPU_CORES".to_string(), request.resources.cpu_cores.to_string());
        env.insert("RAM_SIZE".to_string(), format!("{}G", request.resources.ram_gb));
        env.insert("DISK_SIZE".to_string(), format!("{}G", request.resources.disk_gb));
        env.insert("LANGUAGE".to_string(), request.language.clone());
        env.insert("KEYBOARD".to_string(), request.keyboard.clone());
        env.insert("KVM".to_string(), "Y".to_string());
        if request.debug {
            env.insert("DEBUG".to_string(), "Y".to_string());
        }
        if !request.dns_servers.is_empty() {
            env.insert("DNS".to_string(), request.dns_servers.join(","));
        }
        env
    }
}

fn advisories(request: &DeploymentRequest, plan: &NetworkPlan) -> Vec<String> {
    let mut warnings = Vec::new();
    if request.credentials.is_weak() {
        warnings.push("密码少于 8 位".to_string());
    }
    if plan.publishes_ports() {
        for (field, port) in [("rdp_port", request.rdp_port()), ("vnc_port", request.vnc_port())] {
            if port < 1024 {
                warnings.push(format!("{} {} 是特权端口，建议使用 1024-65535", field, port));
            }
        }
    }
    warnings
}

fn check_port(port: u32, field: &str) -> Result<u16> {
    match u16::try_from(port) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(Error::validation(field, format!("端口 {} 超出范围 1-65535", port))),
    }
}

fn validate_services(services: &EnterpriseServices) -> Result<()> {
    let snmp = &services.snmp;
    if snmp.enabled {
        if snmp.community.as_deref().map_or(true, |c| c.trim().is_empty()) {
            return Err(Error::validation("services.snmp.community", "启用 SNMP 时必须提供 community"));
        }
        check_port(snmp.port, "services.snmp.port")?;
    }

    let wmi = &services.wmi;
    if wmi.enabled && wmi.allowed_hosts.iter().all(|h| h.trim().is_empty()) {
        return Err(Error::validation("services.wmi.allowed_hosts", "启用 WMI 时必须提供允许访问的主机"));
    }

    let logging = &services.logging;
    if logging.enabled {
        if logging.server_host.as_deref().map_or(true, |h| h.trim().is_empty()) {
            return Err(Error::validation("services.logging.server_host", "启用集中日志时必须提供日志服务器"));
        }
        check_port(logging.server_port, "services.logging.server_port")?;
        if !matches!(logging.protocol.as_str(), "udp" | "tcp") {
            return Err(Error::validation(
                "services.logging.protocol",
                format!("不支持的协议: {}", logging.protocol),
            ));
        }
    }
    Ok(())
}

/// 静态地址模式下容器内部也要知道自己的地址
fn static_address_env(env: &mut BTreeMap<String, String>, attachment: &NetworkAttachment) -> Result<()> {
    if let NetworkAttachment::Static { address, gateway, subnet, .. } = attachment {
        let cidr: Ipv4Cidr = subnet
            .parse()
            .map_err(|e: String| Error::topology("network.prefix", e))?;
        env.insert("IP".to_string(), address.clone());
        env.insert("GATEWAY".to_string(), gateway.clone());
        env.insert("NETMASK".to_string(), cidr.netmask().to_string());
    }
    Ok(())
}

/// 各企业服务使用互不相交的键前缀，合并不会冲突
fn merge_service_env(env: &mut BTreeMap<String, String>, services: &EnterpriseServices) {
    let snmp = &services.snmp;
    if snmp.enabled {
        env.insert("SNMP_ENABLED".to_string(), "Y".to_string());
        if let Some(community) = &snmp.community {
            env.insert("SNMP_COMMUNITY".to_string(), community.clone());
        }
        env.insert("SNMP_PORT".to_string(), snmp.port.to_string());
        if let Some(location) = &snmp.location {
            env.insert("SNMP_LOCATION".to_string(), location.clone());
        }
        if let Some(contact) = &snmp.contact {
            env.insert("SNMP_CONTACT".to_string(), contact.clone());
        }
        if !snmp.trap_destinations.is_empty() {
            env.insert("SNMP_TRAPS".to_string(), snmp.trap_destinations.join(","));
        }
    }

    let wmi = &services.wmi;
    if wmi.enabled {
        env.insert("WMI_ENABLED".to_string(), "Y".to_string());
        env.insert("WMI_NAMESPACE".to_string(), wmi.namespace.clone());
        env.insert("WMI_ALLOWED_HOSTS".to_string(), wmi.allowed_hosts.join(","));
    }

    let logging = &services.logging;
    if logging.enabled {
        env.insert("LOGGING_ENABLED".to_string(), "Y".to_string());
        if let Some(host) = &logging.server_host {
            env.insert("LOG_SERVER".to_string(), host.clone());
        }
        env.insert("LOG_PORT".to_string(), logging.server_port.to_string());
        env.insert("LOG_PROTOCOL".to_string(), logging.protocol.clone());
        env.insert("LOG_FORMAT".to_string(), logging.format.clone());
        let sources = logging.sources.names();
        if !sources.is_empty() {
            env.insert("LOG_SOURCES".to_string(), sources.join(","));
        }
    }
    debug!("企业服务环境变量合并完成");
}

fn storage_mounts(request: &DeploymentRequest, storage_path: &Path) -> Vec<VolumeMount> {
    let base = storage_path.display().to_string();
    let base = base.trim_end_matches('/');

    let mut volumes = vec![VolumeMount {
        source: format!("{}/{}", base, request.name),
        target: STORAGE_MOUNT.to_string(),
        read_only: false,
    }];
    if request.storage.file_exchange {
        volumes.push(VolumeMount {
            source: format!("{}/{}-shared", base, request.name),
            target: SHARED_MOUNT.to_string(),
            read_only: false,
        });
    }
    volumes.extend(request.extra_volumes.iter().cloned());
    volumes
}

fn port_mappings(request: &DeploymentRequest) -> Vec<PortMapping> {
    // 已在 validate 中检查过范围
    let rdp = request.rdp_port() as u16;
    let vnc = request.vnc_port() as u16;
    vec![
        PortMapping { host: vnc, container: 8006, protocol: Protocol::Tcp },
        PortMapping { host: rdp, container: 3389, protocol: Protocol::Tcp },
        PortMapping { host: rdp, container: 3389, protocol: Protocol::Udp },
    ]
}

fn default_health_check() -> HealthCheck {
    HealthCheck {
        test: vec![
            "CMD-SHELL".to_string(),
            "nc -z 127.0.0.1 8006 || exit 1".to_string(),
        ],
        interval: "60s".to_string(),
        timeout: "10s".to_string(),
        retries: 5,
        start_period: "5m".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkPlanner;
    use std::path::PathBuf;

    fn request(extra: serde_json::Value) -> DeploymentRequest {
        let mut value = serde_json::json!({
            "name": "t1",
            "version": "11-enterprise",
            "credentials": { "username": "Docker", "password": "$w33t'pa55" },
            "resources": { "cpu_cores": 4, "ram_gb": 8, "disk_gb": 64 }
        });
        for (k, v) in extra.as_object().unwrap() {
            value[k] = v.clone();
        }
        serde_json::from_value(value).unwrap()
    }

    fn generate(req: &DeploymentRequest) -> Result<GeneratedDescriptor> {
        let plan = NetworkPlanner::new().plan(req)?;
        DescriptorGenerator::new("dockurr/windows:latest", ReservedKeys::standard())
            .generate(req, &plan, &PathBuf::from("/srv/dokwin/windows-desktop"))
    }

    #[test]
    fn test_base_descriptor() {
        let out = generate(&request(serde_json::json!({}))).unwrap();
        let d = &out.descriptor;
        assert_eq!(d.devices, vec!["/dev/kvm", "/dev/net/tun"]);
        assert_eq!(d.env("VERSION"), Some("11e"));
        assert_eq!(d.env("RAM_SIZE"), Some("8G"));
        assert_eq!(d.env("CPU_CORES"), Some("4"));
        assert_eq!(d.volumes[0].to_spec(), "/srv/dokwin/windows-desktop/t1:/storage");
        assert_eq!(d.volumes.len(), 1);
        assert_eq!(d.ports.len(), 3);
        assert_eq!(d.restart, RestartPolicy::OnFailure);
        assert_eq!(d.stop_grace_period, "2m");
        assert!(out.env_artifact.contains("PASSWORD='$w33t'\\''pa55'"));
    }

    #[test]
    fn test_file_exchange_volume() {
        let out = generate(&request(serde_json::json!({
            "storage": { "file_exchange": true }
        })))
        .unwrap();
        assert_eq!(
            out.descriptor.volumes[1].to_spec(),
            "/srv/dokwin/windows-desktop/t1-shared:/shared"
        );
    }

    #[test]
    fn test_enterprise_services_merge() {
        let out = generate(&request(serde_json::json!({
            "services": {
                "snmp": { "enabled": true, "community": "public", "trap_destinations": ["192.168.1.50"] },
                "wmi": { "enabled": true, "allowed_hosts": ["10.1.1.10", "10.1.1.11"] },
                "logging": {
                    "enabled": true, "server_host": "logs.local",
                    "sources": { "windows_events": true, "snmp_traps": true }
                }
            }
        })))
        .unwrap();
        let d = &out.descriptor;
        assert_eq!(d.env("SNMP_ENABLED"), Some("Y"));
        assert_eq!(d.env("SNMP_COMMUNITY"), Some("public"));
        assert_eq!(d.env("SNMP_TRAPS"), Some("192.168.1.50"));
        assert_eq!(d.env("WMI_ALLOWED_HOSTS"), Some("10.1.1.10,10.1.1.11"));
        assert_eq!(d.env("LOG_SERVER"), Some("logs.local"));
        assert_eq!(d.env("LOG_SOURCES"), Some("windows_events,snmp_traps"));
    }

    #[test]
    fn test_enabled_service_requires_field() {
        let cases = [
            (serde_json::json!({ "snmp": { "enabled": true } }), "services.snmp.community"),
            (serde_json::json!({ "wmi": { "enabled": true } }), "services.wmi.allowed_hosts"),
            (serde_json::json!({ "logging": { "enabled": true } }), "services.logging.server_host"),
        ];
        for (services, expected) in cases {
            match generate(&request(serde_json::json!({ "services": services }))) {
                Err(Error::Validation { field, .. }) => assert_eq!(field, expected),
                other => panic!("unexpected: {:?}", other.map(|g| g.descriptor)),
            }
        }
    }

    #[test]
    fn test_port_rules() {
        match generate(&request(serde_json::json!({ "rdp_port": 8006 }))) {
            Err(Error::Conflict { field, .. }) => assert_eq!(field, "vnc_port"),
            other => panic!("unexpected: {:?}", other.map(|g| g.descriptor)),
        }
        match generate(&request(serde_json::json!({ "rdp_port": 70000 }))) {
            Err(Error::Validation { field, .. }) => assert_eq!(field, "rdp_port"),
            other => panic!("unexpected: {:?}", other.map(|g| g.descriptor)),
        }
    }

    #[test]
    fn test_reserved_key_collision() {
        for key in ["RAM_SIZE", "SNMP_COMMUNITY", "LOG_SERVER"] {
            let extra = serde_json::json!({ "extra_env": { key: "x" } });
            match generate(&request(extra)) {
                Err(Error::Conflict { field, .. }) => assert_eq!(field, format!("extra_env.{}", key)),
                other => panic!("unexpected: {:?}", other.map(|g| g.descriptor)),
            }
        }

        let out = generate(&request(serde_json::json!({ "extra_env": { "CUSTOM_FLAG": "1" } }))).unwrap();
        assert_eq!(out.descriptor.env("CUSTOM_FLAG"), Some("1"));
    }

    #[test]
    fn test_volume_target_conflict() {
        let extra = serde_json::json!({
            "extra_volumes": [{ "source": "/data/iso", "target": "/storage/" }]
        });
        match generate(&request(extra)) {
            Err(Error::Conflict { field, .. }) => assert_eq!(field, "extra_volumes[0].target"),
            other => panic!("unexpected: {:?}", other.map(|g| g.descriptor)),
        }
    }

    #[test]
    fn test_grace_period_override() {
        let out = generate(&request(serde_json::json!({ "stop_grace_period": "45s" }))).unwrap();
        assert_eq!(out.descriptor.stop_grace_period, "45s");

        match generate(&request(serde_json::json!({ "stop_grace_period": "soon" }))) {
            Err(Error::Validation { field, .. }) => assert_eq!(field, "stop_grace_period"),
            other => panic!("unexpected: {:?}", other.map(|g| g.descriptor)),
        }
    }

    #[test]
    fn test_host_mode_has_no_ports() {
        let out = generate(&request(serde_json::json!({ "network": { "mode": "host" } }))).unwrap();
        assert!(out.descriptor.ports.is_empty());
        assert_eq!(out.descriptor.attachment, NetworkAttachment::Host);
        assert_eq!(out.descriptor.devices.len(), 2);
    }

    #[test]
    fn test_advisories_do_not_block() {
        let mut req = request(serde_json::json!({ "rdp_port": 389 }));
        req.credentials.password = "short".to_string();
        let out = generate(&req).unwrap();
        assert_eq!(out.warnings.len(), 2);
        assert!(out.warnings[0].contains("8"));
        assert!(out.warnings[1].starts_with("rdp_port 389"));

        assert!(generate(&request(serde_json::json!({}))).unwrap().warnings.is_empty());
    }

    #[test]
    fn test_static_mode_sets_address_env() {
        let out = generate(&request(serde_json::json!({
            "network": { "mode": "static", "address": "192.168.5.10", "gateway": "192.168.5.1", "prefix": 26 }
        })))
        .unwrap();
        let d = &out.descriptor;
        assert_eq!(d.env("IP"), Some("192.168.5.10"));
        assert_eq!(d.env("GATEWAY"), Some("192.168.5.1"));
        assert_eq!(d.env("NETMASK"), Some("255.255.255.192"));
        assert!(out.env_artifact.contains("NETMASK=255.255.255.192"));

        let bridge = generate(&request(serde_json::json!({}))).unwrap();
        assert_eq!(bridge.descriptor.env("IP"), None);
        assert_eq!(bridge.descriptor.env("NETMASK"), None);
    }

    #[test]
    fn test_segment_scenario_t1() {
        let req = request(serde_json::json!({
            "network": {
                "mode": "segment_isolated",
                "subnet": "10.0.0.0/24",
                "gateway": "10.0.0.1",
                "ip_range": "10.0.0.192/29",
                "parent": "eth0",
                "address": "10.0.0.193"
            }
        }));
        let plan = NetworkPlanner::new().plan(&req).unwrap();
        let out = DescriptorGenerator::new("dockurr/windows:latest", ReservedKeys::standard())
            .generate(&req, &plan, Path::new("/srv/dokwin/windows-desktop"))
            .unwrap();

        assert!(out.descriptor.devices.contains(&KVM_DEVICE.to_string()));
        assert!(out.descriptor.devices.contains(&TUN_DEVICE.to_string()));

        let script = plan.setup_procedure("docker").render_script(&req.name);
        let check = script
            .find("if ! docker network inspect dokwin-t1-macvlan")
            .unwrap();
        let create = script.find("docker network create -d macvlan").unwrap();
        assert!(check < create);
        assert!(script.contains("dokwin-t1-macvlan\n"));
    }
}
