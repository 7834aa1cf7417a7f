/// 幂等的网络准备流程
///
/// 每一步都是“先检查，不满足再执行”，可反复运行。
/// 同一组步骤既可以渲染成 shell 脚本产物，也可以由远程翻译器逐条下发。

use common::models::{HostShim, NetworkObject};
use common::utils::{shell_join, shell_quote};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupStep {
    pub description: String,
    /// 检查表达式（shell），成功表示无需执行 action
    pub check: Option<String>,
    pub action: Vec<String>,
}

impl SetupStep {
    /// 合并为单条 shell 命令：`check || action`
    pub fn to_shell(&self) -> String {
        let action = shell_join(&self.action);
        match &self.check {
            Some(check) => format!("{} >/dev/null 2>&1 || {}", check, action),
            None => action,
        }
    }

    /// 远程执行用的 argv
    pub fn to_argv(&self) -> Vec<String> {
        match &self.check {
            Some(_) => vec!["sh".to_string(), "-c".to_string(), self.to_shell()],
            None => self.action.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupProcedure {
    pub network_steps: Vec<SetupStep>,
    pub shim_steps: Vec<SetupStep>,
}

impl SetupProcedure {
    pub fn build(docker_bin: &str, networks: &[NetworkObject], shim: Option<&HostShim>) -> Self {
        Self {
            network_steps: networks
                .iter()
                .map(|net| create_network_step(docker_bin, net))
                .collect(),
            shim_steps: shim.map(shim_steps).unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.network_steps.is_empty() && self.shim_steps.is_empty()
    }

    pub fn steps(&self) -> impl Iterator<Item = &SetupStep> {
        self.network_steps.iter().chain(self.shim_steps.iter())
    }

    /// 渲染为 `#!/bin/sh` 脚本
    pub fn render_script(&self, deployment: &str) -> String {
        let mut out = String::new();
        out.push_str("#!/bin/sh\n");
        out.push_str(&format!("# DokWin 网络准备脚本: {}\n", deployment));
        out.push_str("# 可重复执行，已存在的对象会被跳过\n");
        out.push_str("set -eu\n");

        if self.is_empty() {
            out.push_str("\n# 当前网络模式无需预创建网络对象\n");
            return out;
        }

        for step in &self.network_steps {
            push_step(&mut out, step);
        }

        if !self.shim_steps.is_empty() {
            out.push_str("\n# ---- 宿主机访问隔离网段 (host shim) ----\n");
            for step in &self.shim_steps {
                push_step(&mut out, step);
            }
        }
        out
    }
}

fn push_step(out: &mut String, step: &SetupStep) {
    out.push_str(&format!("\n# {}\n", step.description));
    let action = shell_join(&step.action);
    match &step.check {
        Some(check) => {
            out.push_str(&format!("if ! {} >/dev/null 2>&1; then\n", check));
            out.push_str(&format!("    {}\n", action));
            out.push_str("fi\n");
        }
        None => {
            out.push_str(&action);
            out.push('\n');
        }
    }
}

fn create_network_step(docker_bin: &str, net: &NetworkObject) -> SetupStep {
    let mut action = vec![
        docker_bin.to_string(),
        "network".to_string(),
        "create".to_string(),
        "-d".to_string(),
        net.driver.as_str().to_string(),
        "--subnet".to_string(),
        net.subnet.clone(),
        "--gateway".to_string(),
        net.gateway.clone(),
    ];
    if let Some(range) = &net.ip_range {
        action.push("--ip-range".to_string());
        action.push(range.clone());
    }
    if let Some(parent) = &net.parent {
        action.push("-o".to_string());
        action.push(format!("parent={}", parent));
    }
    action.push(net.name.clone());

    SetupStep {
        description: format!("创建 {} 网络 {}", net.driver.as_str(), net.name),
        check: Some(shell_join(&[docker_bin, "network", "inspect", net.name.as_str()])),
        action,
    }
}

fn shim_steps(shim: &HostShim) -> Vec<SetupStep> {
    let iface = shim.interface.as_str();
    let argv = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    vec![
        SetupStep {
            description: format!("创建 shim 接口 {} (parent {})", iface, shim.parent),
            check: Some(shell_join(&["ip", "link", "show", iface])),
            action: argv(&[
                "ip", "link", "add", iface, "link", shim.parent.as_str(), "type", "macvlan", "mode",
                "bridge",
            ]),
        },
        SetupStep {
            description: format!("为 {} 分配地址 {}", iface, shim.address),
            check: Some(format!(
                "ip -4 addr show dev {} | grep -qF {}",
                shell_quote(iface),
                shell_quote(&format!("inet {}", shim.address))
            )),
            action: argv(&["ip", "addr", "add", shim.address.as_str(), "dev", iface]),
        },
        SetupStep {
            description: format!("启用接口 {}", iface),
            check: Some(format!(
                "ip link show dev {} up | grep -q .",
                shell_quote(iface)
            )),
            action: argv(&["ip", "link", "set", iface, "up"]),
        },
        SetupStep {
            description: format!("经 {} 路由到 {}", iface, shim.route),
            check: Some(format!(
                "ip route show {} dev {} | grep -q .",
                shell_quote(&shim.route),
                shell_quote(iface)
            )),
            action: argv(&["ip", "route", "add", shim.route.as_str(), "dev", iface]),
        },
    ]
}

/// 撤销网络对象（回滚用），同样先检查再删除
pub fn teardown_steps(
    docker_bin: &str,
    networks: &[NetworkObject],
    shim: Option<&HostShim>,
) -> Vec<SetupStep> {
    let mut steps = Vec::new();

    if let Some(shim) = shim {
        let iface = shim.interface.as_str();
        steps.push(SetupStep {
            description: format!("删除 shim 接口 {}", iface),
            check: Some(format!("! ip link show {}", shell_quote(iface))),
            action: vec![
                "ip".to_string(),
                "link".to_string(),
                "del".to_string(),
                iface.to_string(),
            ],
        });
    }

    for net in networks {
        steps.push(SetupStep {
            description: format!("删除网络 {}", net.name),
            check: Some(format!(
                "! {}",
                shell_join(&[docker_bin, "network", "inspect", net.name.as_str()])
            )),
            action: vec![
                docker_bin.to_string(),
                "network".to_string(),
                "rm".to_string(),
                net.name.clone(),
            ],
        });
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::NetworkDriver;

    fn macvlan() -> NetworkObject {
        NetworkObject {
            name: "dokwin-t1-macvlan".to_string(),
            driver: NetworkDriver::Macvlan,
            subnet: "10.0.0.0/24".to_string(),
            gateway: "10.0.0.1".to_string(),
            ip_range: Some("10.0.0.192/29".to_string()),
            parent: Some("eth0".to_string()),
        }
    }

    fn shim() -> HostShim {
        HostShim {
            interface: "dws-t1".to_string(),
            parent: "eth0".to_string(),
            address: "10.0.0.254/32".to_string(),
            route: "10.0.0.192/29".to_string(),
        }
    }

    #[test]
    fn test_network_step_is_check_then_create() {
        let proc = SetupProcedure::build("docker", &[macvlan()], None);
        let step = &proc.network_steps[0];
        assert_eq!(
            step.to_shell(),
            "docker network inspect dokwin-t1-macvlan >/dev/null 2>&1 || \
             docker network create -d macvlan --subnet 10.0.0.0/24 --gateway 10.0.0.1 \
             --ip-range 10.0.0.192/29 -o parent=eth0 dokwin-t1-macvlan"
        );
        assert_eq!(step.to_argv()[0], "sh");
    }

    #[test]
    fn test_script_contains_shim_block() {
        let proc = SetupProcedure::build("docker", &[macvlan()], Some(&shim()));
        let script = proc.render_script("t1");
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("set -eu"));
        assert!(script.contains("if ! docker network inspect dokwin-t1-macvlan >/dev/null 2>&1; then"));
        assert!(script.contains("ip link add dws-t1 link eth0 type macvlan mode bridge"));
        assert!(script.contains("ip route add 10.0.0.192/29 dev dws-t1"));

        // 每个动作都有对应的检查
        assert!(proc.steps().all(|s| s.check.is_some()));
        assert_eq!(script.matches("\nfi\n").count(), 5);
    }

    #[test]
    fn test_empty_procedure_script() {
        let proc = SetupProcedure::build("docker", &[], None);
        assert!(proc.is_empty());
        assert!(proc.render_script("plain").contains("无需预创建"));
    }

    #[test]
    fn test_teardown_order() {
        let steps = teardown_steps("docker", &[macvlan()], Some(&shim()));
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].action, vec!["ip", "link", "del", "dws-t1"]);
        assert!(steps[1].to_shell().ends_with("docker network rm dokwin-t1-macvlan"));
    }
}
