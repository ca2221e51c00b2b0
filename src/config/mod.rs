// 配置管理模块

use crate::constants;
use crate::protocol::TunnelType;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 服务器端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 服务器监听地址
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 隧道控制监听端口（客户端注册连接）
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// 边缘 HTTP 监听端口
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// 隧道域名（子域名在其下分配）
    #[serde(default = "default_domain")]
    pub domain: String,
    /// 认证令牌（客户端注册时校验）
    pub auth_token: String,
    /// TLS 证书路径
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// TLS 私钥路径
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// 是否运行在反向代理后（边缘监听退化为明文 HTTP）
    #[serde(default)]
    pub behind_proxy: bool,
    /// TCP 隧道端口分配范围下限
    #[serde(default = "default_tcp_port_min")]
    pub tcp_port_min: u16,
    /// TCP 隧道端口分配范围上限
    #[serde(default = "default_tcp_port_max")]
    pub tcp_port_max: u16,
    /// 注册限流配置（可选）
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

/// 注册限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 每秒允许的注册数
    pub requests_per_second: u32,
    /// 突发容量
    pub burst_size: u32,
}

/// 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 服务器地址
    pub server_addr: String,
    /// 服务器隧道控制端口
    #[serde(default = "default_control_port")]
    pub server_port: u16,
    /// 认证令牌
    pub auth_token: String,
    /// 是否跳过证书验证（仅用于测试）
    #[serde(default)]
    pub skip_verify: bool,
    /// CA 证书路径（可选）
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

/// 单条隧道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// 隧道类型（http / https / tcp）
    #[serde(default)]
    pub tunnel_type: TunnelType,
    /// 期望的子域名（可选，留空由服务器分配）
    #[serde(default)]
    pub subdomain: Option<String>,
    /// 本地服务地址
    #[serde(default = "default_local_host")]
    pub local_host: String,
    /// 本地服务端口
    pub local_port: u16,
    /// 该隧道的数据连接数（1 条主连接 + N-1 条附加连接）
    #[serde(default = "default_connections")]
    pub connections: usize,
}

/// 客户端完整配置（客户端 + 隧道列表）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFullConfig {
    pub client: ClientConfig,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

/// 应用配置（顶层）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub client: Option<ClientConfig>,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_control_port() -> u16 {
    constants::DEFAULT_SERVER_PORT
}

fn default_http_port() -> u16 {
    constants::DEFAULT_HTTP_PORT
}

fn default_domain() -> String {
    constants::DEFAULT_DOMAIN.to_string()
}

fn default_tcp_port_min() -> u16 {
    constants::DEFAULT_TCP_PORT_MIN
}

fn default_tcp_port_max() -> u16 {
    constants::DEFAULT_TCP_PORT_MAX
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

fn default_connections() -> usize {
    1
}

impl AppConfig {
    /// 加载服务器配置
    pub fn load_server_config(path: &str) -> anyhow::Result<ServerConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let config: AppConfig =
            toml::from_str(&content).context("Failed to parse server configuration")?;
        let server = config
            .server
            .context("Missing [server] section in configuration")?;
        server.validate()?;
        Ok(server)
    }

    /// 加载客户端配置
    pub fn load_client_config(path: &str) -> anyhow::Result<ClientFullConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let config: AppConfig =
            toml::from_str(&content).context("Failed to parse client configuration")?;
        let client = config
            .client
            .context("Missing [client] section in configuration")?;
        let full = ClientFullConfig {
            client,
            tunnels: config.tunnels,
        };
        full.validate()?;
        Ok(full)
    }
}

impl ServerConfig {
    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth_token.is_empty() {
            anyhow::bail!("auth_token must not be empty");
        }
        if self.tcp_port_min >= self.tcp_port_max {
            anyhow::bail!(
                "invalid TCP port range: {}..{}",
                self.tcp_port_min,
                self.tcp_port_max
            );
        }
        if self.domain.is_empty() {
            anyhow::bail!("domain must not be empty");
        }
        match (&self.cert_path, &self.key_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => anyhow::bail!(
                "cert_path and key_path must both be set, or both omitted to auto-generate"
            ),
        }
        Ok(())
    }
}

impl ClientFullConfig {
    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.client.auth_token.is_empty() {
            anyhow::bail!("auth_token must not be empty");
        }
        if self.client.server_addr.is_empty() {
            anyhow::bail!("server_addr must not be empty");
        }
        if self.tunnels.is_empty() {
            anyhow::bail!("at least one [[tunnels]] section is required");
        }
        for (i, tunnel) in self.tunnels.iter().enumerate() {
            if tunnel.local_port == 0 {
                anyhow::bail!("tunnel #{}: local_port must be set", i + 1);
            }
            if tunnel.connections == 0 {
                anyhow::bail!("tunnel #{}: connections must be at least 1", i + 1);
            }
            if let Some(sub) = &tunnel.subdomain {
                if !is_valid_subdomain(sub) {
                    anyhow::bail!("tunnel #{}: invalid subdomain '{}'", i + 1, sub);
                }
            }
        }
        Ok(())
    }
}

/// 子域名合法性：小写字母、数字、连字符，1-63 字符，首尾不为连字符
pub fn is_valid_subdomain(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    if s.starts_with('-') || s.ends_with('-') {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
