/// 检查点持久化
///
/// 每个检查点一个目录：
/// - `metadata.json`：概要与当前状态
/// - `snapshot.json`：变更前快照，只写一次
/// - `rollback_info.json`：回滚后写入

use std::path::{Path, PathBuf};

use common::models::{Checkpoint, CheckpointSnapshot, CheckpointSummary, RollbackRecord};
use common::utils::{days_ago, is_valid_id};
use common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

const METADATA_FILE: &str = "metadata.json";
const SNAPSHOT_FILE: &str = "snapshot.json";
const ROLLBACK_FILE: &str = "rollback_info.json";

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 只接受 `generate_id` 生成的 ID，其余一律视为不存在
    fn dir(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_id(id) {
            return Err(Error::NotFound(format!("检查点 {}", id)));
        }
        Ok(self.root.join(id))
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| Error::Storage(format!("写入 {} 失败: {}", path.display(), e)))
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| Error::Storage(format!("读取 {} 失败: {}", path.display(), e)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// 新建检查点目录并写入快照
    pub async fn create(&self, checkpoint: &Checkpoint) -> Result<()> {
        let dir = self.dir(&checkpoint.id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Storage(format!("创建目录 {} 失败: {}", dir.display(), e)))?;

        Self::write_json(&dir.join(SNAPSHOT_FILE), &checkpoint.snapshot).await?;
        Self::write_json(&dir.join(METADATA_FILE), &checkpoint.summary()).await?;
        debug!("检查点已持久化: {}", dir.display());
        Ok(())
    }

    /// 更新状态
    pub async fn update(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.dir(&checkpoint.id)?.join(METADATA_FILE);
        Self::write_json(&path, &checkpoint.summary()).await
    }

    pub async fn record_rollback(&self, record: &RollbackRecord) -> Result<()> {
        let path = self.dir(&record.checkpoint_id)?.join(ROLLBACK_FILE);
        Self::write_json(&path, record).await
    }

    pub async fn load(&self, id: &str) -> Result<Checkpoint> {
        let dir = self.dir(id)?;
        if !dir.join(METADATA_FILE).exists() {
            return Err(Error::NotFound(format!("检查点 {}", id)));
        }
        let summary: CheckpointSummary = Self::read_json(&dir.join(METADATA_FILE)).await?;
        let snapshot: CheckpointSnapshot = Self::read_json(&dir.join(SNAPSHOT_FILE)).await?;

        Ok(Checkpoint {
            id: summary.id,
            deployment: summary.deployment,
            created_at: summary.created_at,
            timeout_secs: summary.timeout_secs,
            monitoring: summary.monitoring,
            change_kind: summary.change_kind,
            state: summary.state,
            resolved_at: summary.resolved_at,
            note: summary.note,
            snapshot,
        })
    }

    pub async fn rollback_record(&self, id: &str) -> Result<Option<RollbackRecord>> {
        let path = self.dir(id)?.join(ROLLBACK_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_json(&path).await?))
    }

    async fn summaries(&self) -> Result<Vec<(PathBuf, CheckpointSummary)>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => {
                return Err(Error::Storage(format!(
                    "读取目录 {} 失败: {}",
                    self.root.display(),
                    e
                )))
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?
        {
            let meta = entry.path().join(METADATA_FILE);
            if !meta.exists() {
                continue;
            }
            match Self::read_json::<CheckpointSummary>(&meta).await {
                Ok(summary) => out.push((entry.path(), summary)),
                Err(e) => warn!("跳过损坏的检查点 {}: {}", entry.path().display(), e),
            }
        }
        Ok(out)
    }

    /// 历史记录，最新的在前；`days` 限定创建时间范围
    pub async fn history(&self, days: Option<i64>) -> Result<Vec<CheckpointSummary>> {
        let cutoff = days.map(|d| days_ago(d, "days")).transpose()?;
        let mut history: Vec<CheckpointSummary> = self
            .summaries()
            .await?
            .into_iter()
            .map(|(_, s)| s)
            .filter(|s| cutoff.map_or(true, |c| s.created_at >= c))
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(history)
    }

    /// 删除早于 `days_to_keep` 天且已结束的检查点，返回删除数量
    pub async fn cleanup(&self, days_to_keep: i64) -> Result<usize> {
        let cutoff = days_ago(days_to_keep, "days_to_keep")?;
        let mut removed = 0;

        for (dir, summary) in self.summaries().await? {
            if summary.created_at >= cutoff || !summary.state.is_resolved() {
                continue;
            }
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| Error::Storage(format!("删除 {} 失败: {}", dir.display(), e)))?;
            info!("已清理过期检查点: {}", summary.id);
            removed += 1;
        }
        Ok(removed)
    }
}
