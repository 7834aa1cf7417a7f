/// 声明式描述 → 有序命令序列
///
/// `plan` 是纯函数，不接触任何会话；`apply` 在单个会话上严格顺序执行，
/// 任一步骤非零退出即中止，不做补偿。

use std::time::Instant;

use common::models::constants::{SHARED_MOUNT, STORAGE_MOUNT};
use common::models::{HostShim, NetworkAttachment, NetworkObject, ServiceDescriptor};
use common::utils::{parse_grace_period, shell_join, shell_quote};
use common::{Error, Result};
use tracing::{debug, error, info};

use super::session::CommandSession;
use crate::network::procedure::{teardown_steps, SetupProcedure, SetupStep};

/// 计划中的一步
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub argv: Vec<String>,
    /// 与相邻步骤的先后顺序不可交换
    pub order_sensitive: bool,
    pub description: String,
}

impl PlanStep {
    fn new(argv: Vec<String>, order_sensitive: bool, description: impl Into<String>) -> Self {
        Self {
            argv,
            order_sensitive,
            description: description.into(),
        }
    }

    fn from_setup(step: &SetupStep, order_sensitive: bool) -> Self {
        Self::new(step.to_argv(), order_sensitive, step.description.clone())
    }

    pub fn command_line(&self) -> String {
        shell_join(&self.argv)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommandPlan {
    pub deployment: String,
    pub steps: Vec<PlanStep>,
}

impl RemoteCommandPlan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 在预检之后插入步骤（例如存储目录准备）
    pub fn insert_after_preflight(&mut self, steps: Vec<PlanStep>) {
        let at = usize::from(!self.steps.is_empty());
        self.steps.splice(at..at, steps);
    }
}

/// 单步执行结果
#[derive(Debug, Clone)]
pub struct StepResult {
    /// 从 1 开始
    pub index: usize,
    pub description: String,
    pub exit_status: i32,
    pub output: String,
    pub duration_ms: u64,
}

pub struct RemoteTranslator {
    docker_bin: String,
    runtime_endpoint: Option<String>,
    ready_timeout_secs: u64,
}

impl RemoteTranslator {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            runtime_endpoint: None,
            ready_timeout_secs: 120,
        }
    }

    /// 每一步都以 `DOCKER_HOST=<endpoint>` 执行
    pub fn with_runtime_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.runtime_endpoint = endpoint.filter(|e| !e.trim().is_empty());
        self
    }

    pub fn with_ready_timeout(mut self, secs: u64) -> Self {
        self.ready_timeout_secs = secs.max(2);
        self
    }

    fn docker(&self, args: &[&str]) -> Vec<String> {
        std::iter::once(self.docker_bin.as_str())
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect()
    }

    fn with_endpoint(&self, mut step: PlanStep) -> PlanStep {
        if let Some(endpoint) = &self.runtime_endpoint {
            let mut argv = vec!["env".to_string(), format!("DOCKER_HOST={}", endpoint)];
            argv.append(&mut step.argv);
            step.argv = argv;
        }
        step
    }

    /// 生成部署计划
    pub fn plan(&self, descriptor: &ServiceDescriptor) -> Result<RemoteCommandPlan> {
        let name = descriptor.container_name.as_str();
        let mut steps = Vec::new();

        // 1. KVM 预检
        steps.push(PlanStep::new(
            vec!["test".to_string(), "-e".to_string(), "/dev/kvm".to_string()],
            false,
            "检查 KVM 设备",
        ));

        // 2. 网络对象与 host shim，先检查后创建
        let procedure = SetupProcedure::build(
            &self.docker_bin,
            &descriptor.networks,
            descriptor.host_shim.as_ref(),
        );
        steps.extend(procedure.network_steps.iter().map(|s| PlanStep::from_setup(s, true)));
        steps.extend(procedure.shim_steps.iter().map(|s| PlanStep::from_setup(s, true)));

        // 3. 替换同名容器
        steps.push(PlanStep::from_setup(&self.remove_container_step(name), true));

        // 4. 启动容器
        steps.push(PlanStep::new(
            self.run_argv(descriptor)?,
            true,
            format!("启动容器 {}", name),
        ));

        // 5. macvlan 两阶段切换
        if let NetworkAttachment::Segment {
            bootstrap,
            network,
            address,
        } = &descriptor.attachment
        {
            steps.push(PlanStep::new(
                self.wait_running_argv(name),
                true,
                format!("等待容器 {} 运行", name),
            ));
            steps.push(PlanStep::new(
                self.docker(&["network", "disconnect", bootstrap.as_str(), name]),
                true,
                format!("断开引导网络 {}", bootstrap),
            ));
            steps.push(PlanStep::new(
                self.docker(&["network", "connect", "--ip", address.as_str(), network.as_str(), name]),
                true,
                format!("接入隔离网段 {} ({})", network, address),
            ));
        }

        let steps: Vec<PlanStep> = steps.into_iter().map(|s| self.with_endpoint(s)).collect();
        debug!("部署计划 {}: {} 步", name, steps.len());

        Ok(RemoteCommandPlan {
            deployment: descriptor.service_name.clone(),
            steps,
        })
    }

    /// 远端存储目录准备；调用方追加的卷不处理
    pub fn storage_steps(&self, descriptor: &ServiceDescriptor, uid: u32, gid: u32) -> Vec<PlanStep> {
        descriptor
            .volumes
            .iter()
            .filter(|v| v.target == STORAGE_MOUNT || v.target == SHARED_MOUNT)
            .map(|v| {
                PlanStep::new(
                    vec![
                        "install".to_string(),
                        "-d".to_string(),
                        "-o".to_string(),
                        uid.to_string(),
                        "-g".to_string(),
                        gid.to_string(),
                        v.source.clone(),
                    ],
                    false,
                    format!("准备目录 {}", v.source),
                )
            })
            .collect()
    }

    /// 撤销计划：删除容器，再删除 shim 与网络对象
    pub fn teardown_plan(&self, descriptor: &ServiceDescriptor) -> RemoteCommandPlan {
        let name = descriptor.container_name.as_str();
        let mut steps = vec![PlanStep::from_setup(&self.remove_container_step(name), true)];
        steps.extend(
            teardown_steps(
                &self.docker_bin,
                &descriptor.networks,
                descriptor.host_shim.as_ref(),
            )
            .iter()
            .map(|s| PlanStep::from_setup(s, true)),
        );

        RemoteCommandPlan {
            deployment: descriptor.service_name.clone(),
            steps: steps.into_iter().map(|s| self.with_endpoint(s)).collect(),
        }
    }

    /// 只重建网络对象与 shim（回滚时没有旧描述的情形）
    pub fn network_plan(
        &self,
        deployment: &str,
        networks: &[NetworkObject],
        shim: Option<&HostShim>,
    ) -> RemoteCommandPlan {
        let procedure = SetupProcedure::build(&self.docker_bin, networks, shim);
        RemoteCommandPlan {
            deployment: deployment.to_string(),
            steps: procedure
                .steps()
                .map(|s| self.with_endpoint(PlanStep::from_setup(s, true)))
                .collect(),
        }
    }

    fn remove_container_step(&self, name: &str) -> SetupStep {
        SetupStep {
            description: format!("移除已存在的容器 {}", name),
            check: Some(format!(
                "! {}",
                shell_join(&[self.docker_bin.as_str(), "container", "inspect", name])
            )),
            action: self.docker(&["rm", "-f", name]),
        }
    }

    fn run_argv(&self, d: &ServiceDescriptor) -> Result<Vec<String>> {
        let stop_timeout = parse_grace_period(&d.stop_grace_period).ok_or_else(|| {
            Error::validation(
                "stop_grace_period",
                format!("无法解析的时长: {}", d.stop_grace_period),
            )
        })?;

        let mut argv = self.docker(&["run", "-d", "--name", d.container_name.as_str()]);

        for port in &d.ports {
            argv.push("-p".to_string());
            argv.push(port.to_spec());
        }
        for (key, value) in &d.environment {
            argv.push("-e".to_string());
            argv.push(format!("{}={}", key, value));
        }
        for volume in &d.volumes {
            argv.push("-v".to_string());
            argv.push(volume.to_spec());
        }
        argv.push("--restart".to_string());
        argv.push(d.restart.as_str().to_string());
        argv.push("--stop-timeout".to_string());
        argv.push(stop_timeout.to_string());

        if let Some(network) = d.attachment.run_network() {
            argv.push("--network".to_string());
            argv.push(network.to_string());
        }
        if let NetworkAttachment::Static { address, .. } = &d.attachment {
            argv.push("--ip".to_string());
            argv.push(address.clone());
        }

        for cap in &d.capabilities {
            argv.push("--cap-add".to_string());
            argv.push(cap.clone());
        }
        for device in &d.devices {
            argv.push("--device".to_string());
            argv.push(device.clone());
        }

        if let Some(hc) = &d.health_check {
            // CMD-SHELL 形式：第二个元素是完整命令
            if let Some(cmd) = hc.test.get(1) {
                argv.push("--health-cmd".to_string());
                argv.push(cmd.clone());
            }
            argv.push("--health-interval".to_string());
            argv.push(hc.interval.clone());
            argv.push("--health-timeout".to_string());
            argv.push(hc.timeout.clone());
            argv.push("--health-retries".to_string());
            argv.push(hc.retries.to_string());
            argv.push("--health-start-period".to_string());
            argv.push(hc.start_period.clone());
        }

        // 镜像必须在最后
        argv.push(d.image.clone());
        Ok(argv)
    }

    fn wait_running_argv(&self, name: &str) -> Vec<String> {
        let attempts = self.ready_timeout_secs / 2;
        let inspect = format!(
            "{} inspect -f '{{{{.State.Running}}}}' {}",
            shell_quote(&self.docker_bin),
            shell_quote(name)
        );
        let script = format!(
            "i=0; until [ \"$({} 2>/dev/null)\" = true ]; do i=$((i+1)); \
             [ \"$i\" -ge {} ] && exit 1; sleep 2; done",
            inspect, attempts
        );
        vec!["sh".to_string(), "-c".to_string(), script]
    }

    /// 在一个会话上顺序执行计划
    pub async fn apply(
        &self,
        plan: &RemoteCommandPlan,
        session: &mut dyn CommandSession,
    ) -> Result<Vec<StepResult>> {
        info!(
            "开始执行部署计划 {} ({} 步, 会话 {})",
            plan.deployment,
            plan.len(),
            session.describe()
        );

        let mut results = Vec::with_capacity(plan.len());
        for (i, step) in plan.steps.iter().enumerate() {
            let index = i + 1;
            debug!("[{}/{}] {}", index, plan.len(), step.description);

            let started = Instant::now();
            // 传输层错误也要带上步骤序号，exit_status 记为 -1
            let output = session.exec(&step.argv).await.map_err(|e| {
                error!("第 {} 步执行中断: {} ({})", index, step.description, e);
                Error::RemoteStep {
                    index,
                    command: step.command_line(),
                    exit_status: -1,
                    output: e.to_string(),
                }
            })?;
            let duration_ms = started.elapsed().as_millis() as u64;

            if !output.success() {
                error!(
                    "第 {} 步失败 (exit={}): {}",
                    index, output.exit_status, step.description
                );
                return Err(Error::RemoteStep {
                    index,
                    command: step.command_line(),
                    exit_status: output.exit_status,
                    output: output.combined(),
                });
            }

            results.push(StepResult {
                index,
                description: step.description.clone(),
                exit_status: output.exit_status,
                output: output.combined(),
                duration_ms,
            });
        }

        info!("部署计划 {} 执行完成", plan.deployment);
        Ok(results)
    }
}
