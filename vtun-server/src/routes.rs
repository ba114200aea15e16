/*!
VTun Server 路由模块

根据目的地址选择转发的端点，包括：
- 本地隧道网段的直接查找
- 端点宣告的 allowed-ips 网段
*/

use ipnet::{AddrParseError, Ipv4Net};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::RwLock;
use vtun::{Endpoint, EndpointRegistry};

/// 路由表
///
/// 网段只记录所属端点的虚拟IP，使用时再通过端点表解析。
#[derive(Debug)]
pub struct RouteTable {
    local: Ipv4Net,
    registry: Arc<EndpointRegistry>,
    routes: RwLock<HashMap<Ipv4Net, Ipv4Addr>>,
}

impl RouteTable {
    pub fn new(local: Ipv4Net, registry: Arc<EndpointRegistry>) -> Self {
        Self {
            local: local.trunc(),
            registry,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// 查找目的地址对应的端点
    ///
    /// 本地网段内的地址只按虚拟IP查找。网段重叠时返回遍历到的第一个匹配。
    pub async fn route_for(&self, dst: Ipv4Addr) -> Option<Endpoint> {
        if self.local.contains(&dst) {
            return self.registry.find_by_ip(dst).await;
        }

        let owner = self
            .routes
            .read()
            .await
            .iter()
            .find(|(cidr, _)| cidr.contains(&dst))
            .map(|(_, owner)| *owner)?;

        self.registry.find_by_ip(owner).await
    }

    /// 为端点添加网段，同一网段的旧所属端点被替换
    pub async fn add_routes(&self, owner: Ipv4Addr, cidrs: &[Ipv4Net]) {
        let mut routes = self.routes.write().await;
        for cidr in cidrs {
            let cidr = cidr.trunc();
            if let Some(prev) = routes.insert(cidr, owner) {
                if prev != owner {
                    log::warn!("Route {} moved from {} to {}", cidr, prev, owner);
                }
            }
            log::debug!("Route {} via {}", cidr, owner);
        }
    }

    /// 删除端点的所有网段，返回删除的数量
    pub async fn remove_routes_of(&self, owner: Ipv4Addr) -> usize {
        let mut routes = self.routes.write().await;
        let before = routes.len();
        routes.retain(|_, ip| *ip != owner);
        before - routes.len()
    }

    pub async fn routes(&self) -> Vec<(Ipv4Net, Ipv4Addr)> {
        let mut routes: Vec<_> = self
            .routes
            .read()
            .await
            .iter()
            .map(|(cidr, owner)| (*cidr, *owner))
            .collect();
        routes.sort();
        routes
    }

    pub async fn routes_of(&self, owner: Ipv4Addr) -> Vec<Ipv4Net> {
        let mut cidrs: Vec<_> = self
            .routes
            .read()
            .await
            .iter()
            .filter(|(_, ip)| **ip == owner)
            .map(|(cidr, _)| *cidr)
            .collect();
        cidrs.sort();
        cidrs
    }

    pub fn local(&self) -> Ipv4Net {
        self.local
    }
}

/// 解析逗号分隔的网段列表，任何一项无法解析时整个列表无效
pub fn parse_allowed_ips(list: &str) -> Result<Vec<Ipv4Net>, AddrParseError> {
    list.split(',').map(|item| item.trim().parse()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    async fn table() -> (RouteTable, Endpoint) {
        let registry = Arc::new(EndpointRegistry::new());
        let endpoint = registry
            .create(
                SocketAddr::from(([192, 0, 2, 7], 4000)),
                "alice",
                net("192.168.223.100/24"),
            )
            .await
            .unwrap();
        (RouteTable::new(net("192.168.223.254/24"), registry), endpoint)
    }

    #[tokio::test]
    async fn route_through_announced_networks() {
        let (table, endpoint) = table().await;
        table
            .add_routes(
                endpoint.address(),
                &[net("10.66.0.0/16"), net("192.168.224.0/24")],
            )
            .await;

        assert_eq!(table.route_for(ip("10.66.0.1")).await, Some(endpoint.clone()));
        assert_eq!(table.route_for(ip("192.168.224.1")).await, Some(endpoint.clone()));
        assert_eq!(table.route_for(ip("192.168.225.1")).await, None);

        assert_eq!(table.remove_routes_of(endpoint.address()).await, 2);
        assert!(table.routes().await.is_empty());
        assert_eq!(table.route_for(ip("10.66.0.1")).await, None);
    }

    #[tokio::test]
    async fn local_subnet_resolves_by_ip() {
        let (table, endpoint) = table().await;
        table
            .add_routes(endpoint.address(), &[net("192.168.223.0/24")])
            .await;

        assert_eq!(table.route_for(ip("192.168.223.100")).await, Some(endpoint));
        assert_eq!(table.route_for(ip("192.168.223.101")).await, None);
    }

    #[tokio::test]
    async fn replace_owner_of_same_cidr() {
        let (table, endpoint) = table().await;
        table.add_routes(ip("192.168.223.101"), &[net("10.1.0.0/16")]).await;
        table.add_routes(endpoint.address(), &[net("10.1.0.0/16")]).await;

        assert_eq!(
            table.routes().await,
            vec![(net("10.1.0.0/16"), endpoint.address())]
        );
        assert_eq!(table.remove_routes_of(ip("192.168.223.101")).await, 0);
        assert_eq!(table.routes_of(endpoint.address()).await, vec![net("10.1.0.0/16")]);
    }

    #[tokio::test]
    async fn route_to_removed_endpoint_is_none() {
        let (table, endpoint) = table().await;
        table.add_routes(endpoint.address(), &[net("10.66.0.0/16")]).await;
        table.registry.remove(endpoint.address()).await;

        assert_eq!(table.route_for(ip("10.66.1.1")).await, None);
    }

    #[test]
    fn parse_allowed_ip_list() {
        assert_eq!(
            parse_allowed_ips("10.1.0.0/16, 10.2.0.0/24").unwrap(),
            vec![net("10.1.0.0/16"), net("10.2.0.0/24")]
        );
        assert_eq!(parse_allowed_ips("10.3.0.0/16").unwrap(), vec![net("10.3.0.0/16")]);
    }

    #[test]
    fn one_bad_entry_rejects_whole_list() {
        for list in ["10.1.0.0/16,bogus", "10.1.0.0/16,,10.2.0.0/24", "10.1.0.0", ""] {
            assert!(parse_allowed_ips(list).is_err(), "{list}");
        }
    }
}
