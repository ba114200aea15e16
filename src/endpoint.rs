/*!
VTun端点模块

管理已认证的对端，包括：
- 端点信息
- 按远端地址和虚拟IP双向索引的端点表
*/

use chrono::{DateTime, Local};
use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::sync::RwLock;

/// 端点表错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("ip {ip} already in use by {remote}")]
    IpInUse { ip: Ipv4Addr, remote: SocketAddr },

    #[error("endpoint {remote} already exists with ip {ip}")]
    EndpointExists { remote: SocketAddr, ip: Ipv4Addr },
}

/// 已认证的对端
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub remote: SocketAddr,
    pub user: String,
    pub ip: Ipv4Net, // 分配的虚拟地址，带前缀长度
    pub login_at: DateTime<Local>,
}

impl Endpoint {
    pub fn new(remote: SocketAddr, user: &str, ip: Ipv4Net) -> Self {
        Self {
            remote,
            user: user.to_string(),
            ip,
            login_at: Local::now(),
        }
    }

    /// 虚拟地址，不带前缀长度
    pub fn address(&self) -> Ipv4Addr {
        self.ip.addr()
    }

    pub fn login_time(&self) -> String {
        self.login_at.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

#[derive(Debug, Default)]
struct Tables {
    by_addr: HashMap<SocketAddr, Endpoint>,
    by_ip: HashMap<Ipv4Addr, SocketAddr>,
}

/// 端点表
///
/// 远端地址和虚拟IP一一对应，两张表由同一把锁保护。
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    tables: RwLock<Tables>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册端点
    pub async fn create(
        &self,
        remote: SocketAddr,
        user: &str,
        ip: Ipv4Net,
    ) -> Result<Endpoint, RegistryError> {
        let mut tables = self.tables.write().await;

        if let Some(owner) = tables.by_ip.get(&ip.addr()) {
            if *owner != remote {
                return Err(RegistryError::IpInUse {
                    ip: ip.addr(),
                    remote: *owner,
                });
            }
        }

        if let Some(existing) = tables.by_addr.get(&remote) {
            return Err(RegistryError::EndpointExists {
                remote,
                ip: existing.address(),
            });
        }

        let endpoint = Endpoint::new(remote, user, ip);
        tables.by_ip.insert(ip.addr(), remote);
        tables.by_addr.insert(remote, endpoint.clone());
        log::debug!("Endpoint {} registered with ip {}", remote, ip);

        Ok(endpoint)
    }

    pub async fn find_by_address(&self, remote: &SocketAddr) -> Option<Endpoint> {
        self.tables.read().await.by_addr.get(remote).cloned()
    }

    pub async fn find_by_ip(&self, ip: Ipv4Addr) -> Option<Endpoint> {
        let tables = self.tables.read().await;
        tables
            .by_ip
            .get(&ip)
            .and_then(|remote| tables.by_addr.get(remote))
            .cloned()
    }

    /// 删除虚拟IP对应的端点
    pub async fn remove(&self, ip: Ipv4Addr) -> Option<Endpoint> {
        let mut tables = self.tables.write().await;
        let remote = tables.by_ip.remove(&ip)?;
        tables.by_addr.remove(&remote)
    }

    /// 只有虚拟IP仍属于同一次登录（远端地址和登录时间都相同）时才删除
    pub async fn remove_if_current(&self, expected: &Endpoint) -> Option<Endpoint> {
        let mut tables = self.tables.write().await;
        let ip = expected.address();

        let current = tables.by_ip.get(&ip).and_then(|remote| tables.by_addr.get(remote))?;
        if current.remote != expected.remote || current.login_at != expected.login_at {
            return None;
        }

        tables.by_ip.remove(&ip);
        tables.by_addr.remove(&expected.remote)
    }

    pub async fn list(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> =
            self.tables.read().await.by_addr.values().cloned().collect();
        endpoints.sort_by_key(|e| e.address());
        endpoints
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.by_addr.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tables.read().await.by_addr.is_empty()
    }
}
