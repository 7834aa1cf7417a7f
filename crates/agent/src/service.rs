/// 部署服务
///
/// 串起整个流程：请求校验 → 存储路径 + 网络规划 → 服务描述 → 本地/远程执行 → 检查点。
/// 同名部署同一时间只允许一个请求在处理（包括回滚回放），有未决检查点时拒绝新的变更。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use common::models::constants::{SHARED_MOUNT, STORAGE_MOUNT};
use common::models::{
    ApplyReceipt, ChangeKind, Checkpoint, CheckpointSnapshot, CheckpointSummary,
    DeploymentRequest, MonitoringMode, NetworkAttachment, ServiceDescriptor, StorageMode,
};
use common::{Error, Result};

use crate::checkpoint::{
    CheckpointCoordinator, CheckpointStore, ConnectivityProbe, ContainerHealthProbe, HealthProbe,
    NewCheckpoint, SnapshotRestorer,
};
use crate::config::AgentConfig;
use crate::descriptor::{render_compose, DescriptorGenerator, ReservedKeys};
use crate::network::NetworkPlanner;
use crate::remote::{ApplyTarget, CommandSession, RemoteTranslator};
use crate::storage::{normalize_version, VersionResolver, VersionTable};

/// 生成的全部产物（无副作用）
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedArtifacts {
    pub descriptor: ServiceDescriptor,
    /// docker compose YAML
    pub compose: String,
    /// `.env` 文本
    pub env_file: String,
    /// 网络准备脚本，bridge/host/none 模式为空
    pub network_script: Option<String>,
    pub storage_path: PathBuf,
    /// 不阻止部署的提示（弱密码、特权端口）
    pub warnings: Vec<String>,
}

/// 为部署目标打开命令会话
#[async_trait]
pub trait SessionOpener: Send + Sync + 'static {
    async fn open(&self, target: &ApplyTarget) -> Result<Box<dyn CommandSession>>;
}

/// 默认实现：本机进程或 SSH
pub struct TargetOpener {
    connect_timeout: Duration,
}

impl TargetOpener {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl SessionOpener for TargetOpener {
    async fn open(&self, target: &ApplyTarget) -> Result<Box<dyn CommandSession>> {
        target.open(self.connect_timeout).await
    }
}

/// 部署登记：执行目标在下发前登记，描述只在执行成功后登记
#[derive(Debug, Default)]
struct Deployments {
    descriptors: HashMap<String, ServiceDescriptor>,
    targets: HashMap<String, ApplyTarget>,
}

type Registry = Arc<RwLock<Deployments>>;

/// 按部署名互斥，部署与回滚回放共用；最后一个持有者释放时移除条目
#[derive(Clone, Default)]
struct NameLocks {
    inner: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

struct NameGuard {
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: NameLocks,
}

impl NameLocks {
    fn entry(&self, name: &str) -> Arc<Mutex<()>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn prune(&self, name: &str) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(name).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(name);
        }
    }

    /// 已被占用时立即返回冲突
    fn try_acquire(&self, name: &str) -> Result<NameGuard> {
        let lock = self.entry(name);
        match lock.try_lock_owned() {
            Ok(guard) => Ok(self.guard(name, guard)),
            Err(_) => {
                self.prune(name);
                Err(Error::conflict("name", format!("部署 {} 正在处理中", name)))
            }
        }
    }

    /// 等待当前持有者释放
    async fn acquire(&self, name: &str) -> NameGuard {
        let guard = self.entry(name).lock_owned().await;
        self.guard(name, guard)
    }

    fn guard(&self, name: &str, guard: OwnedMutexGuard<()>) -> NameGuard {
        NameGuard {
            name: name.to_string(),
            guard: Some(guard),
            locks: self.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.prune(&self.name);
    }
}

/// 回滚：撤销受保护的变更，重建旧网络并重新应用旧描述
struct PlanRestorer {
    docker_bin: String,
    ready_timeout_secs: u64,
    opener: Arc<dyn SessionOpener>,
    registry: Registry,
    locks: NameLocks,
}

impl PlanRestorer {
    async fn replay(
        &self,
        checkpoint: &Checkpoint,
        translator: &RemoteTranslator,
        session: &mut dyn CommandSession,
    ) -> Result<()> {
        let snapshot = &checkpoint.snapshot;

        translator
            .apply(&translator.teardown_plan(&snapshot.applied), session)
            .await?;

        match &snapshot.prior_descriptor {
            Some(prior) => {
                translator.apply(&translator.plan(prior)?, session).await?;
            }
            None if !snapshot.prior_networks.is_empty() => {
                let plan = translator.network_plan(
                    &checkpoint.deployment,
                    &snapshot.prior_networks,
                    None,
                );
                translator.apply(&plan, session).await?;
            }
            None => debug!("部署 {} 之前不存在，撤销后无需恢复", checkpoint.deployment),
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotRestorer for PlanRestorer {
    async fn restore(&self, checkpoint: &Checkpoint) -> Result<()> {
        // 与同名部署互斥，进行中的下发结束后才开始回放
        let _guard = self.locks.acquire(&checkpoint.deployment).await;

        let target = self
            .registry
            .read()
            .await
            .targets
            .get(&checkpoint.deployment)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("部署 {} 的执行目标", checkpoint.deployment)))?;

        let translator = RemoteTranslator::new(self.docker_bin.clone())
            .with_runtime_endpoint(target.runtime_endpoint())
            .with_ready_timeout(self.ready_timeout_secs);

        let mut session = self.opener.open(&target).await?;
        let result = self.replay(checkpoint, &translator, session.as_mut()).await;
        if let Err(e) = session.close().await {
            debug!("关闭会话失败: {}", e);
        }
        result?;

        let mut registry = self.registry.write().await;
        match &checkpoint.snapshot.prior_descriptor {
            Some(prior) => {
                registry
                    .descriptors
                    .insert(checkpoint.deployment.clone(), prior.clone());
            }
            None => {
                registry.descriptors.remove(&checkpoint.deployment);
                registry.targets.remove(&checkpoint.deployment);
            }
        }
        Ok(())
    }
}

pub struct DeploymentService {
    config: AgentConfig,
    resolver: VersionResolver,
    planner: NetworkPlanner,
    generator: DescriptorGenerator,
    coordinator: CheckpointCoordinator,
    opener: Arc<dyn SessionOpener>,
    registry: Registry,
    locks: NameLocks,
}

impl DeploymentService {
    pub fn new(config: AgentConfig) -> Self {
        let opener = Arc::new(TargetOpener::new(Duration::from_secs(
            config.ssh_connect_timeout_secs,
        )));
        Self::with_opener(config, opener)
    }

    pub fn with_opener(config: AgentConfig, opener: Arc<dyn SessionOpener>) -> Self {
        let registry: Registry = Arc::new(RwLock::new(Deployments::default()));
        let locks = NameLocks::default();
        let restorer = Arc::new(PlanRestorer {
            docker_bin: config.docker_bin.clone(),
            ready_timeout_secs: config.segment_ready_timeout_secs,
            opener: opener.clone(),
            registry: registry.clone(),
            locks: locks.clone(),
        });
        let coordinator = CheckpointCoordinator::new(
            restorer,
            Some(CheckpointStore::new(config.checkpoint_dir.clone())),
            Duration::from_secs(config.probe_interval_secs),
            config.probe_failure_threshold,
        );

        Self {
            resolver: VersionResolver::new(
                VersionTable::standard(&config.storage_root),
                config.runtime_uid,
                config.runtime_gid,
            ),
            planner: NetworkPlanner::new(),
            generator: DescriptorGenerator::new(config.image.clone(), ReservedKeys::standard()),
            coordinator,
            opener,
            registry,
            locks,
            config,
        }
    }

    pub fn coordinator(&self) -> &CheckpointCoordinator {
        &self.coordinator
    }

    fn storage_path(&self, request: &DeploymentRequest) -> PathBuf {
        match &request.storage.mode {
            StorageMode::VersionIsolated => self
                .resolver
                .resolve_path(&normalize_version(&request.version)),
            StorageMode::Custom { host_path } => PathBuf::from(host_path),
        }
    }

    /// 生成描述与配套产物，不写任何文件
    pub fn generate(&self, request: &DeploymentRequest) -> Result<GeneratedArtifacts> {
        request.check()?;

        let storage_path = self.storage_path(request);
        let plan = self.planner.plan(request)?;
        let generated = self.generator.generate(request, &plan, &storage_path)?;
        let compose = render_compose(&generated.descriptor)?;

        let procedure = plan.setup_procedure(&self.config.docker_bin);
        let network_script = if procedure.is_empty() {
            None
        } else {
            Some(procedure.render_script(&request.name))
        };

        Ok(GeneratedArtifacts {
            descriptor: generated.descriptor,
            compose,
            env_file: generated.env_artifact,
            network_script,
            storage_path,
            warnings: generated.warnings,
        })
    }

    /// 写入输出目录，返回写入的文件
    pub async fn write_artifacts(&self, artifacts: &GeneratedArtifacts) -> Result<Vec<PathBuf>> {
        let dir = &self.config.output_dir;
        let name = &artifacts.descriptor.service_name;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::Storage(format!("创建输出目录 {} 失败: {}", dir.display(), e)))?;

        let mut files = vec![
            (dir.join(format!("{}-docker-compose.yml", name)), &artifacts.compose),
            (dir.join(format!("{}.env", name)), &artifacts.env_file),
        ];
        if let Some(script) = &artifacts.network_script {
            files.push((dir.join(format!("{}-network-setup.sh", name)), script));
        }

        let mut written = Vec::with_capacity(files.len());
        for (path, content) in files {
            write_file(&path, content).await?;
            written.push(path);
        }

        if artifacts.network_script.is_some() {
            let script = dir.join(format!("{}-network-setup.sh", name));
            set_executable(&script).await?;
        }

        info!("📝 产物已写入 {}: {} 个文件", dir.display(), written.len());
        Ok(written)
    }

    /// 生成并执行部署，启用回滚时返回检查点信息
    ///
    /// 检查点在下发前创建：执行中途失败时它保持未决，可以手动或超时回滚到变更前的状态。
    pub async fn apply(&self, request: &DeploymentRequest, target: ApplyTarget) -> Result<ApplyReceipt> {
        let _guard = self.locks.try_acquire(&request.name)?;

        if let Some(pending) = self.coordinator.active_for(&request.name).await {
            return Err(Error::conflict(
                "name",
                format!("部署 {} 存在未决检查点 {}", request.name, pending.id),
            ));
        }

        let artifacts = self.generate(request)?;
        self.write_artifacts(&artifacts).await?;
        let descriptor = artifacts.descriptor;

        let translator = RemoteTranslator::new(self.config.docker_bin.clone())
            .with_runtime_endpoint(target.runtime_endpoint())
            .with_ready_timeout(self.config.segment_ready_timeout_secs);
        let mut plan = translator.plan(&descriptor)?;

        match &target {
            ApplyTarget::Local => self.prepare_local_storage(&descriptor).await?,
            ApplyTarget::Remote(_) => {
                let (uid, gid) = self.resolver.owner();
                plan.insert_after_preflight(translator.storage_steps(&descriptor, uid, gid));
            }
        }

        let prior = self.descriptor_snapshot(&request.name).await;
        let monitoring = request.rollback.monitoring;
        let checkpoint = if request.rollback.enabled {
            let checkpoint = self
                .coordinator
                .create(NewCheckpoint {
                    deployment: request.name.clone(),
                    change_kind: change_kind(&descriptor.attachment),
                    timeout_secs: request.rollback.timeout_secs,
                    monitoring,
                    snapshot: CheckpointSnapshot {
                        prior_networks: prior
                            .as_ref()
                            .map(|d| d.networks.clone())
                            .unwrap_or_default(),
                        prior_descriptor: prior,
                        applied: descriptor.clone(),
                    },
                })
                .await?;
            Some(checkpoint)
        } else {
            None
        };

        // 回滚回放需要知道执行目标，先于下发登记
        self.registry
            .write()
            .await
            .targets
            .insert(request.name.clone(), target.clone());

        let result = match self.opener.open(&target).await {
            Ok(mut session) => {
                let result = translator.apply(&plan, session.as_mut()).await;
                if let Err(e) = session.close().await {
                    debug!("关闭会话失败: {}", e);
                }
                result
            }
            Err(e) => Err(e),
        };
        let steps = match result {
            Ok(steps) => steps,
            Err(e) => {
                if let Some(cp) = &checkpoint {
                    warn!(
                        "部署 {} 执行失败，检查点 {} 保持未决，可回滚到变更前状态",
                        request.name, cp.id
                    );
                }
                return Err(e);
            }
        };

        self.registry
            .write()
            .await
            .descriptors
            .insert(request.name.clone(), descriptor.clone());

        let mut receipt = ApplyReceipt {
            deployment: request.name.clone(),
            checkpoint_id: None,
            timeout_secs: None,
            monitoring: None,
            steps_executed: steps.len(),
        };

        let Some(checkpoint) = checkpoint else {
            info!("🚀 部署 {} 完成 (未启用回滚)", request.name);
            return Ok(receipt);
        };

        if let Some(probe) = self.probe_for(monitoring, &target, &descriptor) {
            // 检查点可能已经超时回滚，监测启动失败不影响本次部署结果
            if let Err(e) = self.coordinator.start_monitoring(&checkpoint.id, probe).await {
                warn!("检查点 {} 未能启动健康监测: {}", checkpoint.id, e);
            }
        }

        info!(
            "🚀 部署 {} 完成，请在 {}s 内确认检查点 {}",
            request.name, checkpoint.timeout_secs, checkpoint.id
        );
        receipt.checkpoint_id = Some(checkpoint.id);
        receipt.timeout_secs = Some(checkpoint.timeout_secs);
        receipt.monitoring = Some(monitoring);
        Ok(receipt)
    }

    async fn prepare_local_storage(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        for volume in descriptor
            .volumes
            .iter()
            .filter(|v| v.target == STORAGE_MOUNT || v.target == SHARED_MOUNT)
        {
            self.resolver.ensure_directory(Path::new(&volume.source)).await?;
        }
        Ok(())
    }

    fn probe_for(
        &self,
        mode: MonitoringMode,
        target: &ApplyTarget,
        descriptor: &ServiceDescriptor,
    ) -> Option<Arc<dyn HealthProbe>> {
        let timeout = Duration::from_secs(self.config.ssh_connect_timeout_secs);
        match mode {
            MonitoringMode::Timer => None,
            MonitoringMode::Connectivity => {
                Some(Arc::new(ConnectivityProbe::new(target.clone(), timeout)))
            }
            MonitoringMode::ContainerHealth => Some(Arc::new(ContainerHealthProbe::new(
                target.clone(),
                timeout,
                self.config.docker_bin.clone(),
                descriptor.container_name.clone(),
            ))),
        }
    }

    pub async fn confirm(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.coordinator.confirm(checkpoint_id).await
    }

    pub async fn rollback(&self, checkpoint_id: &str, reason: &str) -> Result<Checkpoint> {
        self.coordinator.rollback(checkpoint_id, reason).await
    }

    pub async fn checkpoint(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.coordinator.status(checkpoint_id).await
    }

    pub async fn history(&self, days: Option<i64>) -> Result<Vec<CheckpointSummary>> {
        self.coordinator.history(days).await
    }

    pub async fn cleanup(&self, days_to_keep: i64) -> Result<usize> {
        self.coordinator.cleanup(days_to_keep).await
    }

    /// 该部署当前未决或正在回放的检查点
    pub async fn active_checkpoint(&self, name: &str) -> Option<Checkpoint> {
        self.coordinator.active_for(name).await
    }

    /// 只读副本，供顾问类消费者使用
    pub async fn descriptor_snapshot(&self, name: &str) -> Option<ServiceDescriptor> {
        self.registry.read().await.descriptors.get(name).cloned()
    }
}

fn change_kind(attachment: &NetworkAttachment) -> ChangeKind {
    match attachment {
        NetworkAttachment::Bridge => ChangeKind::Container,
        NetworkAttachment::Segment { .. } => ChangeKind::SegmentNetwork,
        _ => ChangeKind::Network,
    }
}

async fn write_file(path: &Path, content: &str) -> Result<()> {
    tokio::fs::write(path, content)
        .await
        .map_err(|e| Error::Storage(format!("写入 {} 失败: {}", path.display(), e)))
}

async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) =
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
    {
        warn!("设置 {} 可执行权限失败: {}", path.display(), e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::session::CommandOutput;
    use crate::remote::{RemoteTarget, SshAuth};
    use common::models::CheckpointState;
    use tokio::sync::{Notify, Semaphore};

    /// 所有会话共用的脚本：记录命令，命中 `fail_on` 的命令返回非零，
    /// 设置了 `hold` 时每条命令都要先拿到一个许可
    #[derive(Default)]
    struct Script {
        log: StdMutex<Vec<Vec<String>>>,
        fail_on: StdMutex<Option<String>>,
        hold: StdMutex<Option<Arc<Semaphore>>>,
        entered: Notify,
    }

    struct RecordingOpener {
        script: Arc<Script>,
    }

    struct RecordingSession {
        script: Arc<Script>,
    }

    #[async_trait]
    impl CommandSession for RecordingSession {
        async fn exec(&mut self, argv: &[String]) -> Result<CommandOutput> {
            self.script.log.lock().unwrap().push(argv.to_vec());

            let hold = self.script.hold.lock().unwrap().clone();
            if let Some(gate) = hold {
                self.script.entered.notify_one();
                gate.acquire().await.unwrap().forget();
            }

            let joined = argv.join(" ");
            let fail_on = self.script.fail_on.lock().unwrap().clone();
            match fail_on {
                Some(pattern) if joined.contains(pattern.as_str()) => Ok(CommandOutput {
                    exit_status: 125,
                    stdout: String::new(),
                    stderr: "docker: error".to_string(),
                }),
                _ => Ok(CommandOutput::default()),
            }
        }

        fn describe(&self) -> String {
            "recording".to_string()
        }
    }

    #[async_trait]
    impl SessionOpener for RecordingOpener {
        async fn open(&self, _target: &ApplyTarget) -> Result<Box<dyn CommandSession>> {
            Ok(Box::new(RecordingSession {
                script: self.script.clone(),
            }))
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        output: PathBuf,
        script: Arc<Script>,
        service: Arc<DeploymentService>,
    }

    impl Fixture {
        fn executed(&self) -> Vec<String> {
            self.script
                .log
                .lock()
                .unwrap()
                .iter()
                .map(|argv| argv.join(" "))
                .collect()
        }

        fn clear_log(&self) {
            self.script.log.lock().unwrap().clear();
        }

        fn fail_on(&self, pattern: Option<&str>) {
            *self.script.fail_on.lock().unwrap() = pattern.map(str::to_string);
        }
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            storage_root: tmp.path().join("storage"),
            output_dir: tmp.path().join("output"),
            checkpoint_dir: tmp.path().join("checkpoints"),
            ..AgentConfig::default()
        };
        let script = Arc::new(Script::default());
        let opener = Arc::new(RecordingOpener {
            script: script.clone(),
        });
        Fixture {
            output: config.output_dir.clone(),
            service: Arc::new(DeploymentService::with_opener(config, opener)),
            script,
            _tmp: tmp,
        }
    }

    fn remote() -> ApplyTarget {
        ApplyTarget::Remote(RemoteTarget {
            host: "10.0.0.5".to_string(),
            port: 22,
            username: "ops".to_string(),
            auth: SshAuth::Password {
                password: "secret".to_string(),
            },
            runtime_endpoint: None,
            host_key_fingerprint: None,
        })
    }

    fn request(network: serde_json::Value) -> DeploymentRequest {
        serde_json::from_value(serde_json::json!({
            "name": "t1",
            "version": "11",
            "credentials": { "username": "Docker", "password": "pa$$ word" },
            "resources": { "cpu_cores": 2, "ram_gb": 4, "disk_gb": 64 },
            "network": network
        }))
        .unwrap()
    }

    fn static_request() -> DeploymentRequest {
        request(serde_json::json!({
            "mode": "static", "address": "192.168.5.10", "gateway": "192.168.5.1"
        }))
    }

    #[tokio::test]
    async fn test_generate_has_no_side_effects() {
        let f = fixture();
        let artifacts = f.service.generate(&request(serde_json::json!({ "mode": "bridge" }))).unwrap();

        assert!(artifacts.compose.contains("pa$$$$ word"));
        assert!(artifacts.env_file.contains("PASSWORD='pa$$ word'"));
        assert!(artifacts.network_script.is_none());
        assert!(artifacts.storage_path.ends_with("windows-desktop"));
        assert!(artifacts.warnings.is_empty());
        assert!(!f.output.exists());
        assert!(f.executed().is_empty());
    }

    #[tokio::test]
    async fn test_generate_reports_weak_password() {
        let f = fixture();
        let mut req = request(serde_json::json!({ "mode": "bridge" }));
        req.credentials.password = "1234".to_string();

        let artifacts = f.service.generate(&req).unwrap();
        assert_eq!(artifacts.warnings.len(), 1);
        assert!(artifacts.env_file.contains("PASSWORD=1234"));
    }

    #[tokio::test]
    async fn test_segment_missing_field_writes_nothing() {
        let f = fixture();
        let req = request(serde_json::json!({
            "mode": "macvlan",
            "subnet": "192.168.10.0/24",
            "gateway": "192.168.10.1",
            "parent": "eth0",
            "address": "192.168.10.50"
        }));

        match f.service.apply(&req, remote()).await {
            Err(Error::NetworkTopology { field, .. }) => assert_eq!(field, "network.ip_range"),
            other => panic!("unexpected: {:?}", other.map(|r| r.deployment)),
        }
        assert!(!f.output.exists());
        assert!(f.executed().is_empty());
        assert!(f.service.active_checkpoint("t1").await.is_none());
    }

    #[tokio::test]
    async fn test_apply_confirm_cycle() {
        let f = fixture();
        let req = request(serde_json::json!({ "mode": "bridge" }));

        let receipt = f.service.apply(&req, remote()).await.unwrap();
        let id = receipt.checkpoint_id.clone().unwrap();
        assert_eq!(receipt.timeout_secs, Some(180));
        assert_eq!(receipt.monitoring, Some(MonitoringMode::Timer));
        assert!(f.output.join("t1-docker-compose.yml").exists());
        assert!(f.output.join("t1.env").exists());

        let commands = f.executed();
        assert_eq!(commands[0], "test -e /dev/kvm");
        assert!(commands[1].starts_with("install -d -o 1000 -g 1000 "));
        assert!(commands.last().unwrap().ends_with("dockurr/windows:latest"));

        // 未确认前拒绝新的变更
        assert!(matches!(
            f.service.apply(&req, remote()).await,
            Err(Error::Conflict { .. })
        ));

        let confirmed = f.service.confirm(&id).await.unwrap();
        assert_eq!(confirmed.state, CheckpointState::Confirmed);
        assert!(matches!(
            f.service.confirm(&id).await,
            Err(Error::CheckpointState { .. })
        ));

        let snapshot = f.service.descriptor_snapshot("t1").await.unwrap();
        assert_eq!(snapshot.container_name, "t1");
        assert!(f.service.apply(&req, remote()).await.is_ok());
    }

    #[tokio::test]
    async fn test_rollback_restores_prior_topology() {
        let f = fixture();
        let first = f.service.apply(&static_request(), remote()).await.unwrap();
        f.service.confirm(&first.checkpoint_id.unwrap()).await.unwrap();
        let prior = f.service.descriptor_snapshot("t1").await.unwrap();

        let bridge_req = request(serde_json::json!({ "mode": "bridge" }));
        let second = f.service.apply(&bridge_req, remote()).await.unwrap();
        f.clear_log();

        let rolled = f
            .service
            .rollback(&second.checkpoint_id.unwrap(), "operator request")
            .await
            .unwrap();
        assert_eq!(rolled.state, CheckpointState::RolledBack);

        let commands = f.executed();
        let removed = commands.iter().position(|c| c.contains("rm -f t1")).unwrap();
        let recreated = commands
            .iter()
            .position(|c| c.contains("network create") && c.contains("dokwin-t1-net"))
            .unwrap();
        assert!(removed < recreated);
        assert!(commands.iter().any(|c| c.contains("--ip 192.168.5.10")));
        assert_eq!(f.service.descriptor_snapshot("t1").await.unwrap(), prior);
    }

    #[tokio::test]
    async fn test_failed_apply_leaves_pending_checkpoint() {
        let f = fixture();
        let first = f.service.apply(&static_request(), remote()).await.unwrap();
        f.service.confirm(&first.checkpoint_id.unwrap()).await.unwrap();
        let prior = f.service.descriptor_snapshot("t1").await.unwrap();

        // 旧容器和网络已经拆掉，新容器启动失败
        f.fail_on(Some("run -d"));
        let bridge_req = request(serde_json::json!({ "mode": "bridge" }));
        match f.service.apply(&bridge_req, remote()).await {
            Err(Error::RemoteStep { exit_status, .. }) => assert_eq!(exit_status, 125),
            other => panic!("unexpected: {:?}", other.map(|r| r.deployment)),
        }

        let pending = f.service.active_checkpoint("t1").await.unwrap();
        assert_eq!(pending.state, CheckpointState::Pending);
        assert_eq!(pending.snapshot.prior_descriptor.as_ref(), Some(&prior));
        assert_eq!(f.service.descriptor_snapshot("t1").await.unwrap(), prior);
        assert!(matches!(
            f.service.apply(&bridge_req, remote()).await,
            Err(Error::Conflict { .. })
        ));

        f.fail_on(None);
        f.clear_log();
        let rolled = f.service.rollback(&pending.id, "start failed").await.unwrap();
        assert_eq!(rolled.state, CheckpointState::RolledBack);

        let commands = f.executed();
        assert!(commands
            .iter()
            .any(|c| c.contains("network create") && c.contains("dokwin-t1-net")));
        assert!(commands.iter().any(|c| c.contains("--ip 192.168.5.10")));
        assert_eq!(f.service.descriptor_snapshot("t1").await.unwrap(), prior);
        assert!(f.service.active_checkpoint("t1").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_first_apply_rolls_back_to_nothing() {
        let f = fixture();
        f.fail_on(Some("run -d"));
        let req = request(serde_json::json!({ "mode": "bridge" }));
        assert!(matches!(
            f.service.apply(&req, remote()).await,
            Err(Error::RemoteStep { .. })
        ));
        assert!(f.service.descriptor_snapshot("t1").await.is_none());

        f.fail_on(None);
        let pending = f.service.active_checkpoint("t1").await.unwrap();
        f.service.rollback(&pending.id, "start failed").await.unwrap();
        assert!(f.executed().iter().any(|c| c.contains("rm -f t1")));
        assert!(f.service.registry.read().await.targets.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_replay_holds_deployment_lock() {
        let f = fixture();
        let req = request(serde_json::json!({ "mode": "bridge" }));
        let receipt = f.service.apply(&req, remote()).await.unwrap();
        let id = receipt.checkpoint_id.unwrap();

        let gate = Arc::new(Semaphore::new(0));
        *f.script.hold.lock().unwrap() = Some(gate.clone());
        let service = f.service.clone();
        let rollback =
            tokio::spawn(async move { service.rollback(&id, "operator request").await });
        f.script.entered.notified().await;

        // 回放进行中：锁被占用，同名部署被拒绝
        assert!(f.service.locks.try_acquire("t1").is_err());
        match f.service.apply(&req, remote()).await {
            Err(Error::Conflict { field, .. }) => assert_eq!(field, "name"),
            other => panic!("unexpected: {:?}", other.map(|r| r.deployment)),
        }

        *f.script.hold.lock().unwrap() = None;
        gate.add_permits(1);
        let rolled = rollback.await.unwrap().unwrap();
        assert_eq!(rolled.state, CheckpointState::RolledBack);
        assert_eq!(f.service.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_name_locks_are_released() {
        let f = fixture();
        for name in ["a1", "a2", "a3"] {
            let mut req = request(serde_json::json!({ "mode": "bridge" }));
            req.name = name.to_string();
            req.rollback.enabled = false;
            f.service.apply(&req, remote()).await.unwrap();
        }
        assert_eq!(f.service.locks.len(), 0);

        let held = f.service.locks.try_acquire("a1").unwrap();
        assert!(f.service.locks.try_acquire("a1").is_err());
        assert_eq!(f.service.locks.len(), 1);
        drop(held);
        assert_eq!(f.service.locks.len(), 0);
    }

    #[tokio::test]
    async fn test_rollback_disabled_returns_bare_receipt() {
        let f = fixture();
        let mut req = request(serde_json::json!({ "mode": "host" }));
        req.rollback.enabled = false;

        let receipt = f.service.apply(&req, remote()).await.unwrap();
        assert!(receipt.checkpoint_id.is_none());
        assert!(receipt.steps_executed > 0);
        assert!(f.service.active_checkpoint("t1").await.is_none());
    }
}
