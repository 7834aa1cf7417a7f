/// 工具函数集合

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// 生成唯一 ID
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// 是否为 `generate_id` 生成的 ID
pub fn is_valid_id(id: &str) -> bool {
    Uuid::parse_str(id).is_ok()
}

/// `days` 天前的时间点；负数或超出范围的天数是校验错误
pub fn days_ago(days: i64, field: &str) -> Result<DateTime<Utc>> {
    if days < 0 {
        return Err(Error::validation(field, format!("天数不能为负: {}", days)));
    }
    Duration::try_days(days)
        .and_then(|d| Utc::now().checked_sub_signed(d))
        .ok_or_else(|| Error::validation(field, format!("天数超出范围: {}", days)))
}

/// IPv4 CIDR（网络地址 + 前缀长度）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Option<Self> {
        if prefix > 32 {
            return None;
        }
        Some(Self { addr, prefix })
    }

    /// 由主机地址和前缀长度计算所在网段
    pub fn containing(host: Ipv4Addr, prefix: u8) -> Option<Self> {
        let cidr = Self::new(host, prefix)?;
        Some(Self {
            addr: cidr.network(),
            prefix,
        })
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix as u32)
        }
    }

    /// 点分十进制子网掩码
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask())
    }

    /// 网络地址
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.network())
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        if parts.len() != 2 {
            return Err(format!("无效的 CIDR 格式: {}", s));
        }

        let addr: Ipv4Addr = parts[0]
            .parse()
            .map_err(|_| format!("无效的 IP 地址: {}", parts[0]))?;
        let prefix: u8 = parts[1]
            .parse()
            .map_err(|_| format!("无效的前缀长度: {}", parts[1]))?;

        Self::new(addr, prefix).ok_or_else(|| format!("前缀长度超出范围: {}", prefix))
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(cidr: Ipv4Cidr) -> Self {
        cidr.to_string()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// 校验网络接口名：仅允许字母数字、点、横线、下划线，且不超过内核限制的 15 个字符
pub fn is_safe_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// 校验部署名称（同时用作容器名）
pub fn is_valid_deployment_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

/// 校验环境变量名
pub fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '@' | '%' | '+' | '=' | ',')
}

/// 按 POSIX shell 规则引用参数；无特殊字符时原样返回
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty() && value.chars().all(is_shell_safe) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// 将 argv 拼接为可直接交给远端 shell 的命令行
pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// 解析停止宽限期为秒数
///
/// `"2m"` → 120，`"45s"` → 45，纯数字视为秒。
pub fn parse_grace_period(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(minutes) = value.strip_suffix('m') {
        return minutes.trim().parse::<u64>().ok().and_then(|m| m.checked_mul(60));
    }
    if let Some(seconds) = value.strip_suffix('s') {
        return seconds.trim().parse::<u64>().ok();
    }
    value.parse::<u64>().ok()
}
