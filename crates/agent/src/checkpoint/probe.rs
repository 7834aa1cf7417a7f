/// 健康探测
///
/// 检查点处于 pending 时按固定间隔执行；连续失败达到阈值即触发自动回滚。

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::remote::{ApplyTarget, CommandSession};

#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    /// 探测一次，true 表示健康
    async fn check(&self) -> bool;

    fn name(&self) -> &'static str;
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

async fn open(target: &ApplyTarget, timeout: Duration) -> Option<Box<dyn CommandSession>> {
    match target.open(timeout).await {
        Ok(session) => Some(session),
        Err(e) => {
            debug!("探测会话建立失败: {}", e);
            None
        }
    }
}

/// 外部连通性：任一目标可达即视为健康
pub struct ConnectivityProbe {
    target: ApplyTarget,
    connect_timeout: Duration,
    hosts: Vec<String>,
}

impl ConnectivityProbe {
    pub fn new(target: ApplyTarget, connect_timeout: Duration) -> Self {
        Self {
            target,
            connect_timeout,
            hosts: vec![
                "8.8.8.8".to_string(),
                "1.1.1.1".to_string(),
                "google.com".to_string(),
            ],
        }
    }
}

#[async_trait]
impl HealthProbe for ConnectivityProbe {
    async fn check(&self) -> bool {
        let Some(mut session) = open(&self.target, self.connect_timeout).await else {
            return false;
        };

        let mut reachable = false;
        for host in &self.hosts {
            let cmd = argv(&["ping", "-c", "1", "-W", "2", host.as_str()]);
            if matches!(session.exec(&cmd).await, Ok(out) if out.success()) {
                reachable = true;
                break;
            }
        }
        let _ = session.close().await;
        reachable
    }

    fn name(&self) -> &'static str {
        "connectivity"
    }
}

/// 容器运行且健康状态为 healthy / starting / 无健康检查
pub struct ContainerHealthProbe {
    target: ApplyTarget,
    connect_timeout: Duration,
    docker_bin: String,
    container: String,
    runtime_endpoint: Option<String>,
}

impl ContainerHealthProbe {
    pub fn new(
        target: ApplyTarget,
        connect_timeout: Duration,
        docker_bin: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        let runtime_endpoint = target.runtime_endpoint();
        Self {
            target,
            connect_timeout,
            docker_bin: docker_bin.into(),
            container: container.into(),
            runtime_endpoint,
        }
    }

    fn inspect(&self, format: &str) -> Vec<String> {
        let mut cmd = Vec::new();
        if let Some(endpoint) = &self.runtime_endpoint {
            cmd.push("env".to_string());
            cmd.push(format!("DOCKER_HOST={}", endpoint));
        }
        cmd.extend(argv(&[
            self.docker_bin.as_str(),
            "inspect",
            "--format",
            format,
            self.container.as_str(),
        ]));
        cmd
    }
}

/// 健康状态是否可接受
pub fn acceptable_health(status: &str) -> bool {
    matches!(status.trim(), "healthy" | "starting" | "" | "<no value>")
}

#[async_trait]
impl HealthProbe for ContainerHealthProbe {
    async fn check(&self) -> bool {
        let Some(mut session) = open(&self.target, self.connect_timeout).await else {
            return false;
        };

        let running = matches!(
            session.exec(&self.inspect("{{.State.Running}}")).await,
            Ok(out) if out.success() && out.stdout.trim() == "true"
        );
        let healthy = running
            && matches!(
                session.exec(&self.inspect("{{if .State.Health}}{{.State.Health.Status}}{{end}}")).await,
                Ok(out) if out.success() && acceptable_health(&out.stdout)
            );

        let _ = session.close().await;
        healthy
    }

    fn name(&self) -> &'static str {
        "container_health"
    }
}
