/// 命令会话抽象
///
/// 本地通过 tokio 子进程执行，远程通过 SSH 执行；
/// 翻译器只依赖这个 trait，测试里可以换成假的会话。

use std::process::Stdio;

use async_trait::async_trait;
use common::{Error, Result};
use tokio::process::Command;
use tracing::debug;

/// 单条命令的执行结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// stdout + stderr，用于错误报告
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.trim().to_string(),
            (true, false) => self.stderr.trim().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim(), self.stderr.trim()),
        }
    }
}

/// 命令会话
#[async_trait]
pub trait CommandSession: Send {
    /// 执行一条命令；非零退出码不算错误，由调用方判断
    async fn exec(&mut self, argv: &[String]) -> Result<CommandOutput>;

    /// 会话描述（日志用）
    fn describe(&self) -> String;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// 本机会话
#[derive(Debug, Default)]
pub struct LocalSession;

impl LocalSession {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandSession for LocalSession {
    async fn exec(&mut self, argv: &[String]) -> Result<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Internal("空命令".to_string()))?;

        debug!("本地执行: {}", argv.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Internal(format!("启动命令 {} 失败: {}", program, e)))?;

        Ok(CommandOutput {
            // 被信号终止时没有退出码
            exit_status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}
