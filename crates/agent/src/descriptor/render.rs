/// 产物渲染：compose YAML 与 `.env`

use std::collections::BTreeMap;

use serde::Serialize;

use common::models::{NetworkAttachment, NetworkDriver, ServiceDescriptor};
use common::utils::shell_quote;
use common::Result;

#[derive(Debug, Serialize)]
struct ComposeFile {
    services: BTreeMap<String, ComposeService>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    networks: BTreeMap<String, ComposeNetwork>,
}

#[derive(Debug, Serialize)]
struct ComposeService {
    image: String,
    container_name: String,
    environment: BTreeMap<String, String>,
    devices: Vec<String>,
    cap_add: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    volumes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    networks: Option<BTreeMap<String, ServiceNetwork>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    healthcheck: Option<ComposeHealthCheck>,
    restart: String,
    stop_grace_period: String,
    deploy: ComposeDeploy,
}

#[derive(Debug, Serialize)]
struct ServiceNetwork {
    ipv4_address: String,
}

#[derive(Debug, Serialize)]
struct ComposeHealthCheck {
    test: Vec<String>,
    interval: String,
    timeout: String,
    retries: u32,
    start_period: String,
}

#[derive(Debug, Serialize)]
struct ComposeDeploy {
    resources: ComposeResources,
}

#[derive(Debug, Serialize)]
struct ComposeResources {
    limits: ComposeLimits,
}

#[derive(Debug, Serialize)]
struct ComposeLimits {
    cpus: String,
    memory: String,
}

#[derive(Debug, Serialize)]
struct ComposeNetwork {
    driver: String,
    ipam: ComposeIpam,
}

#[derive(Debug, Serialize)]
struct ComposeIpam {
    config: Vec<ComposeIpamConfig>,
}

#[derive(Debug, Serialize)]
struct ComposeIpamConfig {
    subnet: String,
    gateway: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_range: Option<String>,
}

/// compose 会对 `$` 做变量插值，需要写成 `$$`
fn escape_compose(value: &str) -> String {
    value.replace('$', "$$")
}

/// 渲染 docker compose 文件
pub fn render_compose(descriptor: &ServiceDescriptor) -> Result<String> {
    let environment = descriptor
        .environment
        .iter()
        .map(|(k, v)| (k.clone(), escape_compose(v)))
        .collect();

    let mut labels = BTreeMap::new();
    let mut networks = BTreeMap::new();
    let (network_mode, service_networks) = match &descriptor.attachment {
        NetworkAttachment::Bridge => (None, None),
        NetworkAttachment::Host => (Some("host".to_string()), None),
        NetworkAttachment::Disabled => (Some("none".to_string()), None),
        NetworkAttachment::Static {
            network, address, ..
        } => {
            let mut attach = BTreeMap::new();
            attach.insert(
                network.clone(),
                ServiceNetwork {
                    ipv4_address: address.clone(),
                },
            );
            (None, Some(attach))
        }
        NetworkAttachment::Segment {
            bootstrap,
            network,
            address,
        } => {
            // macvlan 接入需在容器启动后切换，compose 只负责引导阶段
            labels.insert("dokwin.network.segment".to_string(), network.clone());
            labels.insert("dokwin.network.address".to_string(), address.clone());
            (Some(bootstrap.clone()), None)
        }
    };

    for net in &descriptor.networks {
        // macvlan 网络由准备脚本创建，compose 不接管
        if net.driver == NetworkDriver::Macvlan {
            continue;
        }
        networks.insert(
            net.name.clone(),
            ComposeNetwork {
                driver: net.driver.as_str().to_string(),
                ipam: ComposeIpam {
                    config: vec![ComposeIpamConfig {
                        subnet: net.subnet.clone(),
                        gateway: net.gateway.clone(),
                        ip_range: net.ip_range.clone(),
                    }],
                },
            },
        );
    }

    let service = ComposeService {
        image: descriptor.image.clone(),
        container_name: descriptor.container_name.clone(),
        environment,
        devices: descriptor.devices.clone(),
        cap_add: descriptor.capabilities.clone(),
        ports: descriptor.ports.iter().map(|p| p.to_spec()).collect(),
        volumes: descriptor.volumes.iter().map(|v| v.to_spec()).collect(),
        network_mode,
        networks: service_networks,
        labels,
        healthcheck: descriptor.health_check.as_ref().map(|h| ComposeHealthCheck {
            test: h.test.clone(),
            interval: h.interval.clone(),
            timeout: h.timeout.clone(),
            retries: h.retries,
            start_period: h.start_period.clone(),
        }),
        restart: descriptor.restart.as_str().to_string(),
        stop_grace_period: descriptor.stop_grace_period.clone(),
        deploy: ComposeDeploy {
            resources: ComposeResources {
                limits: ComposeLimits {
                    cpus: descriptor.limits.cpus.to_string(),
                    memory: format!("{}G", descriptor.limits.memory_gb),
                },
            },
        },
    };

    let mut services = BTreeMap::new();
    services.insert(descriptor.service_name.clone(), service);

    Ok(serde_yaml::to_string(&ComposeFile { services, networks })?)
}

/// 渲染 `.env` 文件：每行 `KEY=VALUE`，含特殊字符的值加单引号
pub fn render_env_file(descriptor: &ServiceDescriptor) -> String {
    let mut out = format!("# DokWin environment for {}\n", descriptor.service_name);
    out.push_str("# Generated file, edit the deployment request instead\n");
    for (key, value) in &descriptor.environment {
        out.push_str(key);
        out.push('=');
        out.push_str(&shell_quote(value));
        out.push('\n');
    }
    out
}
