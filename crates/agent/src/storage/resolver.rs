/// 版本 → 存储路径解析
///
/// 桌面版共用一个存储目录，服务器版按发行年份各自独立。
/// 未识别的版本回落到桌面目录并告警，不报错。

use std::path::{Path, PathBuf};

use common::{Error, Result};
use tracing::{debug, info, warn};

/// UI 版本字符串 → 镜像版本标识
const VERSION_ALIASES: &[(&str, &str)] = &[
    ("11-pro", "11"),
    ("11-enterprise", "11e"),
    ("11-ltsc", "11l"),
    ("10-pro", "10"),
    ("10-enterprise", "10e"),
    ("10-ltsc", "10l"),
    ("8-enterprise", "8e"),
    ("8.1-enterprise", "8e"),
    ("7-ultimate", "7u"),
    ("vista-ultimate", "vu"),
    ("2000", "2k"),
];

const DESKTOP_PREFIXES: &[&str] = &["11", "10", "8", "7", "vista", "vu", "xp", "2k", "win"];

const SERVER_YEARS: &[&str] = &["2025", "2022", "2019", "2016", "2012", "2008", "2003"];

/// 规范化版本字符串：去空白、小写、应用别名；未知字符串原样（小写）返回
pub fn normalize_version(raw: &str) -> String {
    let v = raw.trim().to_lowercase();
    VERSION_ALIASES
        .iter()
        .find(|(alias, _)| *alias == v)
        .map(|(_, flag)| flag.to_string())
        .unwrap_or(v)
}

/// 版本族 → 存储路径表，构造后不可变
#[derive(Debug, Clone)]
pub struct VersionTable {
    desktop: PathBuf,
    servers: Vec<(&'static str, PathBuf)>,
}

impl VersionTable {
    /// 在给定根目录下生成标准布局
    pub fn standard(root: &Path) -> Self {
        Self {
            desktop: root.join("windows-desktop"),
            servers: SERVER_YEARS
                .iter()
                .map(|year| (*year, root.join(format!("windows-server-{}", year))))
                .collect(),
        }
    }

    pub fn desktop_path(&self) -> &Path {
        &self.desktop
    }

    fn lookup(&self, tag: &str) -> Option<&Path> {
        if let Some((_, path)) = self.servers.iter().find(|(year, _)| tag.starts_with(year)) {
            return Some(path);
        }
        if DESKTOP_PREFIXES.iter().any(|p| tag.starts_with(p)) {
            return Some(&self.desktop);
        }
        None
    }
}

pub struct VersionResolver {
    table: VersionTable,
    uid: u32,
    gid: u32,
}

impl VersionResolver {
    pub fn new(table: VersionTable, uid: u32, gid: u32) -> Self {
        Self { table, uid, gid }
    }

    pub fn owner(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }

    /// 解析版本对应的存储路径
    pub fn resolve_path(&self, tag: &str) -> PathBuf {
        let normalized = normalize_version(tag);
        match self.table.lookup(&normalized) {
            Some(path) => {
                debug!("版本 {} 使用存储路径 {}", normalized, path.display());
                path.to_path_buf()
            }
            None => {
                warn!(
                    "未识别的版本 {}，回落到默认存储路径 {}",
                    tag,
                    self.table.desktop_path().display()
                );
                self.table.desktop_path().to_path_buf()
            }
        }
    }

    /// 确保目录存在并归属运行用户；可重复调用
    pub async fn ensure_directory(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        let (uid, gid) = (self.uid, self.gid);

        tokio::task::spawn_blocking(move || {
            if !path.exists() {
                info!("创建存储目录: {}", path.display());
            }
            // create_dir_all 对已存在目录与并发创建都是成功
            std::fs::create_dir_all(&path).map_err(|e| {
                Error::Storage(format!("创建目录 {} 失败: {}", path.display(), e))
            })?;
            std::os::unix::fs::chown(&path, Some(uid), Some(gid)).map_err(|e| {
                Error::Storage(format!(
                    "设置目录 {} 属主 {}:{} 失败: {}",
                    path.display(),
                    uid,
                    gid,
                    e
                ))
            })?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("目录任务异常退出: {}", e)))?
    }
}
