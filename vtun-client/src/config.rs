/*!
VTun Client 配置模块

定义和加载客户端配置，包括：
- 服务端地址
- 加密配置
- 用户凭据
- allowed-ips
- 日志配置
*/

use crate::client::ClientOptions;
use ipnet::Ipv4Net;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;
use vtun::{Cipher, CipherKind};

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Toml parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required configuration: {0}")]
    Missing(String),
}

/// 客户端配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClientConfig {
    /// 服务端地址 `host:port`
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub cipher: CipherKind,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub passwd: String,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub device_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ClientConfig {
    pub fn cipher(&self) -> Result<Cipher, ConfigError> {
        Cipher::new(self.cipher, self.key.as_bytes())
            .map_err(|e| ConfigError::Invalid(format!("key: {}", e)))
    }

    pub fn allowed_ips(&self) -> Result<Vec<Ipv4Net>, ConfigError> {
        self.allowed_ips
            .iter()
            .map(|cidr| {
                cidr.parse()
                    .map_err(|_| ConfigError::Invalid(format!("allowed_ips {}", cidr)))
            })
            .collect()
    }

    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        match self.log_level.to_ascii_lowercase().as_str() {
            "debug" => Ok(LevelFilter::Debug),
            "info" => Ok(LevelFilter::Info),
            "warn" => Ok(LevelFilter::Warn),
            "error" => Ok(LevelFilter::Error),
            other => Err(ConfigError::Invalid(format!("log_level {}", other))),
        }
    }

    pub fn options(&self) -> Result<ClientOptions, ConfigError> {
        let mut options = ClientOptions::new(&self.user, &self.passwd);
        options.allowed_ips = self.allowed_ips()?;
        Ok(options)
    }

    /// 解析服务端地址，只使用IPv4
    pub async fn target_addr(&self) -> Result<SocketAddr, ConfigError> {
        tokio::net::lookup_host(&self.target)
            .await?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| {
                ConfigError::Invalid(format!("target {} has no ipv4 address", self.target))
            })
    }
}

/// 加载配置
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ClientConfig, ConfigError> {
    let mut file = File::open(path)?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    let config: ClientConfig = toml::from_str(&content)?;
    Ok(config)
}

/// 验证配置
pub fn validate_config(config: &ClientConfig) -> Result<(), ConfigError> {
    if config.target.is_empty() {
        return Err(ConfigError::Missing("target".to_string()));
    }

    if config.user.is_empty() {
        return Err(ConfigError::Missing("user".to_string()));
    }

    if config.user.contains('/') || config.passwd.contains('/') {
        return Err(ConfigError::Invalid(
            "user and passwd must not contain '/'".to_string(),
        ));
    }

    if config.passwd.is_empty() {
        return Err(ConfigError::Missing("passwd".to_string()));
    }

    if config.cipher == CipherKind::Aes && config.key.is_empty() {
        return Err(ConfigError::Missing("key".to_string()));
    }
    config.cipher()?;

    config.allowed_ips()?;
    config.level_filter()?;

    Ok(())
}
