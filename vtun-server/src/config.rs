/*!
VTun Server 配置模块

定义和加载服务器配置，包括：
- 隧道基本配置
- 加密配置
- 日志配置
- Web配置
*/

use ipnet::Ipv4Net;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use vtun::{AddressPool, Cipher, CipherKind};

/// 配置文件名
pub const CONFIG_FILE: &str = "config.toml";

/// 用户文件名
pub const USERS_FILE: &str = "users";

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

/// 服务器配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// 服务端隧道地址，如 `192.168.123.1/24`
    #[serde(default)]
    pub ip: String,
    /// 地址池，如 `192.168.123.100-192.168.123.200`
    #[serde(default)]
    pub ip_range: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub cipher: CipherKind,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// 心跳超时，秒
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub web: Web,
}

/// Web配置
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Web {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for Web {
    fn default() -> Self {
        Self {
            enable: false,
            port: default_web_port(),
        }
    }
}

fn default_port() -> u16 {
    vtun::DEFAULT_PORT
}

fn default_web_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_heartbeat_timeout() -> u64 {
    30
}

impl ServerConfig {
    /// 服务端隧道网络
    pub fn local_net(&self) -> Result<Ipv4Net, ConfigError> {
        self.ip
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("ip {} is not an ipv4 cidr", self.ip)))
    }

    pub fn cipher(&self) -> Result<Cipher, ConfigError> {
        Cipher::new(self.cipher, self.key.as_bytes())
            .map_err(|e| ConfigError::Invalid(format!("key: {}", e)))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout)
    }

    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        parse_level(&self.log_level)
    }
}

/// 解析日志级别
pub fn parse_level(level: &str) -> Result<LevelFilter, ConfigError> {
    match level.to_ascii_lowercase().as_str() {
        "debug" => Ok(LevelFilter::Debug),
        "info" => Ok(LevelFilter::Info),
        "warn" => Ok(LevelFilter::Warn),
        "error" => Ok(LevelFilter::Error),
        other => Err(ConfigError::Invalid(format!("log_level {}", other))),
    }
}

pub fn config_path<P: AsRef<Path>>(dir: P) -> PathBuf {
    dir.as_ref().join(CONFIG_FILE)
}

pub fn users_path<P: AsRef<Path>>(dir: P) -> PathBuf {
    dir.as_ref().join(USERS_FILE)
}

/// 加载配置
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ServerConfig, ConfigError> {
    let mut file = File::open(path)?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    let config: ServerConfig = toml::from_str(&content)?;
    Ok(config)
}

/// 验证配置
pub fn validate_config(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.port == 0 {
        return Err(ConfigError::Invalid("port must be greater than 0".to_string()));
    }

    if config.ip.is_empty() {
        return Err(ConfigError::Missing("ip".to_string()));
    }
    config.local_net()?;

    if config.ip_range.is_empty() {
        return Err(ConfigError::Missing("ip_range".to_string()));
    }
    AddressPool::new(&config.ip_range, 0)
        .map_err(|e| ConfigError::Invalid(format!("ip_range: {}", e)))?;

    if config.cipher == CipherKind::Aes && config.key.is_empty() {
        return Err(ConfigError::Missing("key".to_string()));
    }
    config.cipher()?;

    config.level_filter()?;

    if config.heartbeat_timeout == 0 {
        return Err(ConfigError::Invalid(
            "heartbeat_timeout must be greater than 0".to_string(),
        ));
    }

    if config.web.enable && config.web.port == 0 {
        return Err(ConfigError::Invalid("web.port must be greater than 0".to_string()));
    }

    Ok(())
}
