/// DokWin - 公共库
///
/// 提供 Server 和 Agent 共享的请求/描述/检查点类型、错误处理、工具函数等

pub mod errors;
pub mod models;
pub mod utils;

// 重新导出常用类型
pub use errors::{Error, Result};
