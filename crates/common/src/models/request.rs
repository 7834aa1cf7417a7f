use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError, ValidationErrors, ValidationErrorsKind};

use super::checkpoint::MonitoringMode;
use super::constants::{DEFAULT_RDP_PORT, DEFAULT_VNC_PORT};
use super::descriptor::VolumeMount;
use super::network::NetworkSpec;
use crate::errors::{Error, Result};
use crate::utils::is_valid_deployment_name;

/// 部署请求
///
/// 由调用方完整填充后交给核心，核心只读不改。
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DeploymentRequest {
    /// 部署名（同时用作容器名），唯一
    #[validate(length(min = 1, max = 63), custom = "validate_deployment_name")]
    pub name: String,

    /// Windows 版本标签，如 `11`、`11-enterprise`、`2022`
    #[validate(length(min = 1, max = 32))]
    pub version: String,

    #[validate]
    pub credentials: Credentials,

    #[validate]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub storage: StorageSpec,

    /// 未指定时使用 3389；host/none 模式下不得显式指定
    #[serde(default)]
    pub rdp_port: Option<u32>,

    /// 未指定时使用 8006
    #[serde(default)]
    pub vnc_port: Option<u32>,

    #[serde(default)]
    pub network: NetworkSpec,

    #[serde(default)]
    pub services: EnterpriseServices,

    #[serde(default)]
    #[validate]
    pub rollback: RollbackPolicy,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_keyboard")]
    pub keyboard: String,

    #[serde(default)]
    pub dns_servers: Vec<String>,

    #[serde(default)]
    pub debug: bool,

    /// 调用方追加的环境变量，不能覆盖保留键
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,

    #[serde(default)]
    pub extra_volumes: Vec<VolumeMount>,

    /// 覆盖默认停止宽限期，如 `90s`
    #[serde(default)]
    pub stop_grace_period: Option<String>,
}

fn default_language() -> String {
    "English".to_string()
}

fn default_keyboard() -> String {
    "en-US".to_string()
}

fn validate_deployment_name(name: &str) -> std::result::Result<(), ValidationError> {
    if is_valid_deployment_name(name) {
        Ok(())
    } else {
        let mut err = ValidationError::new("deployment_name");
        err.message = Some("只允许字母、数字、横线和下划线".into());
        Err(err)
    }
}

impl DeploymentRequest {
    pub fn rdp_port(&self) -> u32 {
        self.rdp_port.unwrap_or(DEFAULT_RDP_PORT)
    }

    pub fn vnc_port(&self) -> u32 {
        self.vnc_port.unwrap_or(DEFAULT_VNC_PORT)
    }

    pub fn has_explicit_ports(&self) -> bool {
        self.rdp_port.is_some() || self.vnc_port.is_some()
    }

    /// 结构校验，失败时返回第一个违规字段（按字段名排序，嵌套字段用点号连接）
    pub fn check(&self) -> Result<()> {
        match self.validate() {
            Ok(()) => Ok(()),
            Err(errors) => {
                let (field, message) = first_violation("", &errors)
                    .unwrap_or_else(|| ("request".to_string(), errors.to_string()));
                Err(Error::Validation { field, message })
            }
        }
    }
}

fn first_violation(prefix: &str, errors: &ValidationErrors) -> Option<(String, String)> {
    let mut fields: Vec<_> = errors.errors().iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));

    for (field, kind) in fields {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };

        match kind {
            ValidationErrorsKind::Field(errs) => {
                if let Some(e) = errs.first() {
                    let message = match &e.message {
                        Some(m) => m.to_string(),
                        None => format!("违反约束 {}", e.code),
                    };
                    return Some((path, message));
                }
            }
            ValidationErrorsKind::Struct(inner) => {
                if let Some(found) = first_violation(&path, inner) {
                    return Some(found);
                }
            }
            ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    if let Some(found) = first_violation(&format!("{}[{}]", path, index), inner) {
                        return Some(found);
                    }
                }
            }
        }
    }
    None
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Credentials {
    #[validate(length(min = 1, max = 64))]
    pub username: String,
    #[validate(length(min = 1, max = 128))]
    pub password: String,
}

impl Credentials {
    /// 密码过短只告警，不拒绝
    pub fn is_weak(&self) -> bool {
        self.password.chars().count() < 8
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
pub struct ResourceLimits {
    #[validate(range(min = 1, max = 32))]
    pub cpu_cores: u32,
    #[validate(range(min = 2, max = 128))]
    pub ram_gb: u32,
    #[validate(range(min = 20, max = 1000))]
    pub disk_gb: u32,
}

/// 存储规格
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSpec {
    #[serde(default)]
    pub mode: StorageMode,
    /// 额外挂载 `/shared` 用于文件交换
    #[serde(default)]
    pub file_exchange: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageMode {
    /// 按版本族隔离的存储根目录
    #[default]
    VersionIsolated,
    /// 调用方指定宿主机目录
    Custom { host_path: String },
}

/// 企业服务开关，彼此独立
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnterpriseServices {
    #[serde(default)]
    pub snmp: SnmpConfig,
    #[serde(default)]
    pub wmi: WmiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnmpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub community: Option<String>,
    #[serde(default = "default_snmp_port")]
    pub port: u32,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub trap_destinations: Vec<String>,
}

fn default_snmp_port() -> u32 {
    161
}

impl Default for SnmpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            community: None,
            port: default_snmp_port(),
            location: None,
            contact: None,
            trap_destinations: Vec::new(),
        }
    }
}

/// Windows 管理规范 (WMI) 远程访问
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WmiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_wmi_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

fn default_wmi_namespace() -> String {
    "root\\cimv2".to_string()
}

impl Default for WmiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: default_wmi_namespace(),
            allowed_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub server_host: Option<String>,
    #[serde(default = "default_log_port")]
    pub server_port: u32,
    #[serde(default = "default_log_protocol")]
    pub protocol: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default)]
    pub sources: LogSources,
}

fn default_log_port() -> u32 {
    514
}

fn default_log_protocol() -> String {
    "udp".to_string()
}

fn default_log_format() -> String {
    "rfc5424".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_host: None,
            server_port: default_log_port(),
            protocol: default_log_protocol(),
            format: default_log_format(),
            sources: LogSources::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LogSources {
    #[serde(default)]
    pub windows_events: bool,
    #[serde(default)]
    pub snmp_traps: bool,
    #[serde(default)]
    pub performance_metrics: bool,
    #[serde(default)]
    pub application_traces: bool,
}

impl LogSources {
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.windows_events {
            names.push("windows_events");
        }
        if self.snmp_traps {
            names.push("snmp_traps");
        }
        if self.performance_metrics {
            names.push("performance_metrics");
        }
        if self.application_traces {
            names.push("application_traces");
        }
        names
    }
}

/// 回滚策略
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RollbackPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 覆盖按变更类型推导的默认超时
    #[serde(default)]
    #[validate(range(min = 30, max = 3600))]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub monitoring: MonitoringMode,
}

fn default_true() -> bool {
    true
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: None,
            monitoring: MonitoringMode::Timer,
        }
    }
}
