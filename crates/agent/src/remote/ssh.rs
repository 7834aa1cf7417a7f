/// SSH 远程会话（russh 客户端）

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use common::utils::shell_join;
use common::{Error, Result};

use super::session::{CommandOutput, CommandSession};

/// 远程部署目标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    /// 目标主机上的容器运行时地址，如 `unix:///var/run/docker.sock`
    #[serde(default)]
    pub runtime_endpoint: Option<String>,
    /// 固定主机指纹；为空时接受任意主机密钥
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SshAuth {
    Key {
        path: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
    Password {
        password: String,
    },
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key { path, .. } => f.debug_struct("Key").field("path", path).finish(),
            Self::Password { .. } => f.write_str("Password(***)"),
        }
    }
}

struct ClientHandler {
    expected_fingerprint: Option<String>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        match &self.expected_fingerprint {
            Some(expected) => {
                let accepted = expected.trim_start_matches("SHA256:") == fingerprint;
                if !accepted {
                    warn!("主机指纹不匹配: 期望 {}, 实际 {}", expected, fingerprint);
                }
                Ok(accepted)
            }
            None => {
                debug!("接受主机密钥 SHA256:{}", fingerprint);
                Ok(true)
            }
        }
    }
}

/// SSH 会话，一次部署复用同一连接，命令严格顺序执行
pub struct SshSession {
    handle: client::Handle<ClientHandler>,
    label: String,
}

impl SshSession {
    pub async fn connect(target: &RemoteTarget, connect_timeout: Duration) -> Result<Self> {
        let label = format!("{}@{}:{}", target.username, target.host, target.port);
        info!("建立 SSH 连接: {}", label);

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        });
        let handler = ClientHandler {
            expected_fingerprint: target.host_key_fingerprint.clone(),
        };

        let mut handle = tokio::time::timeout(
            connect_timeout,
            client::connect(config, (target.host.as_str(), target.port), handler),
        )
        .await
        .map_err(|_| Error::Ssh(format!("连接 {} 超时", label)))?
        .map_err(|e| Error::Ssh(format!("连接 {} 失败: {}", label, e)))?;

        let authenticated = match &target.auth {
            SshAuth::Key { path, passphrase } => {
                let key_pair = russh_keys::load_secret_key(path, passphrase.as_deref())
                    .map_err(|e| Error::Ssh(format!("加载私钥 {} 失败: {}", path, e)))?;
                handle
                    .authenticate_publickey(&target.username, Arc::new(key_pair))
                    .await
            }
            SshAuth::Password { password } => {
                handle
                    .authenticate_password(&target.username, password)
                    .await
            }
        }
        .map_err(|e| Error::Ssh(format!("认证失败: {}", e)))?;

        if !authenticated {
            return Err(Error::Ssh(format!("{} 认证被拒绝", label)));
        }

        info!("SSH 连接已建立: {}", label);
        Ok(Self { handle, label })
    }
}

#[async_trait]
impl CommandSession for SshSession {
    async fn exec(&mut self, argv: &[String]) -> Result<CommandOutput> {
        let command = shell_join(argv);
        debug!("[{}] 执行: {}", self.label, command);

        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Ssh(format!("打开通道失败: {}", e)))?;
        channel
            .exec(true, command.as_bytes())
            .await
            .map_err(|e| Error::Ssh(format!("下发命令失败: {}", e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        Ok(CommandOutput {
            // 远端未回报退出码时按失败处理
            exit_status: exit_status.map(|c| c as i32).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn close(&mut self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| Error::Ssh(format!("断开连接失败: {}", e)))
    }
}
