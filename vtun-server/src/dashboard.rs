//! 状态页面的数据来源

use crate::server::TunnelServer;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use vtun_web::{EndpointView, RouteView, SnapshotSource};

#[async_trait]
impl SnapshotSource for TunnelServer {
    async fn endpoints(&self) -> Vec<EndpointView> {
        let mut views = Vec::new();
        for endpoint in self.registry().list().await {
            let allowed_ips = self
                .route_table()
                .routes_of(endpoint.address())
                .await
                .iter()
                .map(ToString::to_string)
                .collect();

            views.push(EndpointView {
                user: endpoint.user.clone(),
                remote_address: endpoint.remote.to_string(),
                leased_ip: endpoint.ip.to_string(),
                login_at: endpoint.login_time(),
                allowed_ips,
            });
        }
        views
    }

    async fn routes(&self) -> Vec<RouteView> {
        let mut views = Vec::new();
        for (cidr, owner) in self.route_table().routes().await {
            let owning_user = self
                .registry()
                .find_by_ip(owner)
                .await
                .map(|endpoint| endpoint.user)
                .unwrap_or_default();

            views.push(RouteView {
                cidr: cidr.to_string(),
                owning_user,
                owning_ip: owner.to_string(),
            });
        }
        views
    }
}

/// 启动状态页面，出错只记录日志
pub async fn serve(server: Arc<TunnelServer>, addr: SocketAddr) {
    if let Err(e) = vtun_web::serve(addr, server).await {
        log::error!("Web server on {} stopped: {}", addr, e);
    }
}
