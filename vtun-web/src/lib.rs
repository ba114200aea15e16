/*!
VTun Web 状态页面

只读的隧道状态展示，包括：
- 在线端点列表
- allowed-ips 路由列表
- 简单的HTML页面
*/

use async_trait::async_trait;
use axum::extract::State;
use axum::response::Html;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

const INDEX_HTML: &str = include_str!("../static/index.html");

/// 在线端点
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointView {
    pub user: String,
    pub remote_address: String,
    pub leased_ip: String,
    pub login_at: String,
    pub allowed_ips: Vec<String>,
}

/// 路由条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteView {
    pub cidr: String,
    pub owning_user: String,
    pub owning_ip: String,
}

/// 状态数据来源
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn endpoints(&self) -> Vec<EndpointView>;

    async fn routes(&self) -> Vec<RouteView>;
}

type SharedSource = Arc<dyn SnapshotSource>;

/// 创建路由
pub fn router(source: SharedSource) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/endpoints", get(endpoints))
        .route("/routes", get(routes))
        .layer(CorsLayer::permissive())
        .with_state(source)
}

/// 启动Web服务器
pub async fn serve(addr: SocketAddr, source: SharedSource) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("Web server starting on {}", listener.local_addr()?);
    axum::serve(listener, router(source)).await
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn endpoints(State(source): State<SharedSource>) -> Json<Vec<EndpointView>> {
    Json(source.endpoints().await)
}

async fn routes(State(source): State<SharedSource>) -> Json<Vec<RouteView>> {
    Json(source.routes().await)
}
