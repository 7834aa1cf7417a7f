/// 检查点协调器
///
/// 状态机：pending → confirmed | rolled_back | expired，每个检查点只迁移一次。
/// 进入 pending 时挂上一个可取消的超时任务；确认或手动回滚会取消它，
/// 任务到期未被取消则自动回滚并回放变更前快照。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::models::{
    ChangeKind, Checkpoint, CheckpointSnapshot, CheckpointState, CheckpointSummary,
    MonitoringMode, RollbackRecord,
};
use common::utils::{days_ago, generate_id};
use common::{Error, Result};

use super::probe::HealthProbe;
use super::store::CheckpointStore;

/// 回放快照（撤销受保护的变更并恢复之前的状态）
#[async_trait]
pub trait SnapshotRestorer: Send + Sync + 'static {
    async fn restore(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// 创建检查点所需的参数
#[derive(Debug, Clone)]
pub struct NewCheckpoint {
    pub deployment: String,
    pub change_kind: ChangeKind,
    /// 为空时按变更类型取默认值
    pub timeout_secs: Option<u64>,
    pub monitoring: MonitoringMode,
    pub snapshot: CheckpointSnapshot,
}

struct Entry {
    checkpoint: Checkpoint,
    cancel: CancellationToken,
    /// 已进入 rolled_back，快照仍在回放
    restoring: bool,
}

struct Inner {
    entries: RwLock<HashMap<String, Entry>>,
    store: Option<CheckpointStore>,
    restorer: Arc<dyn SnapshotRestorer>,
    probe_interval: Duration,
    failure_threshold: u32,
}

#[derive(Clone)]
pub struct CheckpointCoordinator {
    inner: Arc<Inner>,
}

impl CheckpointCoordinator {
    pub fn new(
        restorer: Arc<dyn SnapshotRestorer>,
        store: Option<CheckpointStore>,
        probe_interval: Duration,
        failure_threshold: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                store,
                restorer,
                probe_interval: probe_interval.max(Duration::from_secs(1)),
                failure_threshold: failure_threshold.max(1),
            }),
        }
    }

    /// 创建检查点并启动超时任务
    pub async fn create(&self, new: NewCheckpoint) -> Result<Checkpoint> {
        let timeout_secs = new
            .timeout_secs
            .unwrap_or_else(|| new.change_kind.default_timeout_secs());

        let checkpoint = Checkpoint {
            id: generate_id(),
            deployment: new.deployment,
            created_at: Utc::now(),
            timeout_secs,
            monitoring: new.monitoring,
            change_kind: new.change_kind,
            state: CheckpointState::Pending,
            resolved_at: None,
            note: None,
            snapshot: new.snapshot,
        };

        if let Some(store) = &self.inner.store {
            store.create(&checkpoint).await?;
        }

        let cancel = CancellationToken::new();
        self.inner.entries.write().await.insert(
            checkpoint.id.clone(),
            Entry {
                checkpoint: checkpoint.clone(),
                cancel: cancel.clone(),
                restoring: false,
            },
        );

        let inner = self.inner.clone();
        let id = checkpoint.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("检查点 {} 的超时任务已取消", id);
                }
                _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                    warn!("检查点 {} 超时未确认，开始自动回滚", id);
                    auto_rollback(&inner, &id, "超时未确认").await;
                }
            }
        });

        info!(
            "📌 检查点已创建: {} (部署 {}, 超时 {}s, 监控 {:?})",
            checkpoint.id, checkpoint.deployment, timeout_secs, checkpoint.monitoring
        );
        Ok(checkpoint)
    }

    /// 在 pending 期间周期性探测，连续失败达到阈值即自动回滚
    pub async fn start_monitoring(&self, id: &str, probe: Arc<dyn HealthProbe>) -> Result<()> {
        let cancel = {
            let entries = self.inner.entries.read().await;
            let entry = entries
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("检查点 {}", id)))?;
            ensure_pending(&entry.checkpoint)?;
            entry.cancel.clone()
        };

        let inner = self.inner.clone();
        let id = id.to_string();
        info!("开始监控检查点 {} (探测: {})", id, probe.name());

        tokio::spawn(async move {
            let mut failures = 0u32;
            let mut ticker = tokio::time::interval(inner.probe_interval);
            // interval 的第一次 tick 立即返回，跳过它给服务一个启动间隔
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if probe.check().await {
                    failures = 0;
                    continue;
                }

                failures += 1;
                warn!(
                    "检查点 {} 探测 {} 失败 ({}/{})",
                    id,
                    probe.name(),
                    failures,
                    inner.failure_threshold
                );
                if failures >= inner.failure_threshold {
                    let reason = format!("{} 连续 {} 次探测失败", probe.name(), failures);
                    auto_rollback(&inner, &id, &reason).await;
                    break;
                }
            }
        });
        Ok(())
    }

    /// 确认变更
    pub async fn confirm(&self, id: &str) -> Result<Checkpoint> {
        let checkpoint = {
            let mut entries = self.inner.entries.write().await;
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("检查点 {}", id)))?;
            ensure_pending(&entry.checkpoint)?;

            entry.checkpoint.state = CheckpointState::Confirmed;
            entry.checkpoint.resolved_at = Some(Utc::now());
            entry.cancel.cancel();
            entry.checkpoint.clone()
        };

        persist(&self.inner, &checkpoint).await;
        info!("✅ 检查点已确认: {}", id);
        Ok(checkpoint)
    }

    /// 手动回滚
    pub async fn rollback(&self, id: &str, reason: &str) -> Result<Checkpoint> {
        let checkpoint = take_for_rollback(&self.inner, id, reason).await?;
        warn!("检查点 {} 手动回滚: {}", id, reason);

        match self.inner.restorer.restore(&checkpoint).await {
            Ok(()) => {
                finish_rollback(&self.inner, &checkpoint, reason, false, None).await;
                info!("检查点 {} 回滚完成", id);
                self.status(id).await
            }
            Err(e) => {
                error!("检查点 {} 回滚失败: {}", id, e);
                finish_rollback(&self.inner, &checkpoint, reason, false, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// 查询检查点（内存优先，其次持久化记录）
    pub async fn status(&self, id: &str) -> Result<Checkpoint> {
        if let Some(entry) = self.inner.entries.read().await.get(id) {
            return Ok(entry.checkpoint.clone());
        }
        match &self.inner.store {
            Some(store) => store.load(id).await,
            None => Err(Error::NotFound(format!("检查点 {}", id))),
        }
    }

    /// 该部署当前是否有未决或正在回放的检查点
    pub async fn active_for(&self, deployment: &str) -> Option<Checkpoint> {
        self.inner
            .entries
            .read()
            .await
            .values()
            .find(|e| {
                e.checkpoint.deployment == deployment
                    && (e.restoring || !e.checkpoint.state.is_resolved())
            })
            .map(|e| e.checkpoint.clone())
    }

    pub async fn history(&self, days: Option<i64>) -> Result<Vec<CheckpointSummary>> {
        if let Some(store) = &self.inner.store {
            return store.history(days).await;
        }

        let cutoff = days.map(|d| days_ago(d, "days")).transpose()?;
        let mut history: Vec<CheckpointSummary> = self
            .inner
            .entries
            .read()
            .await
            .values()
            .map(|e| e.checkpoint.summary())
            .filter(|s| cutoff.map_or(true, |c| s.created_at >= c))
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(history)
    }

    /// 清理旧检查点（内存中已结束的条目一并移除）
    pub async fn cleanup(&self, days_to_keep: i64) -> Result<usize> {
        let cutoff = days_ago(days_to_keep, "days_to_keep")?;
        let mut removed = 0;
        self.inner.entries.write().await.retain(|_, e| {
            let keep = e.restoring
                || !e.checkpoint.state.is_resolved()
                || e.checkpoint.created_at >= cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });

        match &self.inner.store {
            Some(store) => store.cleanup(days_to_keep).await,
            None => Ok(removed),
        }
    }
}

fn ensure_pending(checkpoint: &Checkpoint) -> Result<()> {
    if checkpoint.state.is_resolved() {
        return Err(Error::CheckpointState {
            checkpoint_id: checkpoint.id.clone(),
            state: checkpoint.state,
        });
    }
    Ok(())
}

/// 在写锁内完成 pending → rolled_back，保证只发生一次
async fn take_for_rollback(inner: &Inner, id: &str, reason: &str) -> Result<Checkpoint> {
    let mut entries = inner.entries.write().await;
    let entry = entries
        .get_mut(id)
        .ok_or_else(|| Error::NotFound(format!("检查点 {}", id)))?;
    ensure_pending(&entry.checkpoint)?;

    entry.checkpoint.state = CheckpointState::RolledBack;
    entry.checkpoint.resolved_at = Some(Utc::now());
    entry.checkpoint.note = Some(reason.to_string());
    entry.restoring = true;
    entry.cancel.cancel();
    Ok(entry.checkpoint.clone())
}

/// 自动回滚；检查点已被处理时静默返回
async fn auto_rollback(inner: &Inner, id: &str, reason: &str) {
    let checkpoint = match take_for_rollback(inner, id, reason).await {
        Ok(cp) => cp,
        Err(e) => {
            debug!("跳过自动回滚 {}: {}", id, e);
            return;
        }
    };

    match inner.restorer.restore(&checkpoint).await {
        Ok(()) => {
            info!("检查点 {} 自动回滚完成", id);
            finish_rollback(inner, &checkpoint, reason, true, None).await;
        }
        Err(e) => {
            error!("检查点 {} 自动回滚失败: {}", id, e);
            finish_rollback(inner, &checkpoint, reason, true, Some(e.to_string())).await;
        }
    }
}

async fn finish_rollback(
    inner: &Inner,
    checkpoint: &Checkpoint,
    reason: &str,
    automatic: bool,
    failure: Option<String>,
) {
    let updated = {
        let mut entries = inner.entries.write().await;
        entries.get_mut(&checkpoint.id).map(|entry| {
            entry.restoring = false;
            if let Some(err) = &failure {
                entry.checkpoint.note = Some(format!("{}; 回滚失败: {}", reason, err));
                // 自动回滚未完成：截止时间已过但状态没有恢复
                if automatic {
                    entry.checkpoint.state = CheckpointState::Expired;
                }
            }
            entry.checkpoint.clone()
        })
    };

    if let Some(cp) = &updated {
        persist(inner, cp).await;
    }

    if let Some(store) = &inner.store {
        let record = RollbackRecord {
            checkpoint_id: checkpoint.id.clone(),
            reason: reason.to_string(),
            automatic,
            success: failure.is_none(),
            error: failure,
            rolled_back_at: Utc::now(),
        };
        if let Err(e) = store.record_rollback(&record).await {
            warn!("写入回滚记录失败 {}: {}", checkpoint.id, e);
        }
    }
}

async fn persist(inner: &Inner, checkpoint: &Checkpoint) {
    if let Some(store) = &inner.store {
        if let Err(e) = store.update(checkpoint).await {
            warn!("检查点 {} 状态持久化失败: {}", checkpoint.id, e);
        }
    }
}
