/// 存储管理
///
/// 按 Windows 版本隔离的存储目录

pub mod resolver;

pub use resolver::{normalize_version, VersionResolver, VersionTable};
