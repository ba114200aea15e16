/*!
VTun Server 服务模块

组合各个组件完成隧道服务，包括：
- UDP接收循环和按标志分发
- 用户登录和地址分配
- 虚拟设备和端点之间的数据转发
- 端点关闭（FIN、心跳超时、服务退出）
*/

use crate::auth::{AuthError, CredentialStore};
use crate::heartbeat::{HeartbeatSupervisor, Timeout};
use crate::routes::{parse_allowed_ips, RouteTable};
use ipnet::Ipv4Net;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use vtun::{
    ipv4_destination, AddressPool, Endpoint, EndpointRegistry, Flag, PoolError, RegistryError,
    Transport, TransportError, TunDevice, MAX_PACKET_SIZE,
};

/// 服务错误
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("address pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("server is already running")]
    AlreadyRunning,
}

/// 登录失败原因，作为ACK负载返回给对端
#[derive(Error, Debug)]
pub enum LoginError {
    #[error("invalid REQ msg")]
    InvalidRequest,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// 端点关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// 对端发送了FIN
    PeerFin,
    HeartbeatTimeout,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerFin => write!(f, "peer closed"),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CloseReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// 服务参数
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// 服务端隧道地址
    pub local: Ipv4Net,
    /// 地址池范围 `start-end`
    pub ip_range: String,
    pub heartbeat_timeout: Duration,
}

/// 隧道服务
pub struct TunnelServer {
    transport: Transport,
    device: Arc<dyn TunDevice>,
    credentials: Arc<dyn CredentialStore>,
    pool: AddressPool,
    registry: Arc<EndpointRegistry>,
    routes: RouteTable,
    heartbeat: HeartbeatSupervisor,
    timeouts: Mutex<Option<mpsc::Receiver<Timeout>>>,
}

impl TunnelServer {
    pub fn new(
        transport: Transport,
        device: Arc<dyn TunDevice>,
        credentials: Arc<dyn CredentialStore>,
        options: ServerOptions,
    ) -> Result<Arc<Self>, ServerError> {
        let pool = AddressPool::new(&options.ip_range, options.local.prefix_len())?;
        let registry = Arc::new(EndpointRegistry::new());
        let routes = RouteTable::new(options.local, registry.clone());
        let (heartbeat, timeouts) = HeartbeatSupervisor::new(options.heartbeat_timeout);

        Ok(Arc::new(Self {
            transport,
            device,
            credentials,
            pool,
            registry,
            routes,
            heartbeat,
            timeouts: Mutex::new(Some(timeouts)),
        }))
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn route_table(&self) -> &RouteTable {
        &self.routes
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// 运行服务，套接字或设备出错时返回
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let timeouts = self
            .timeouts
            .lock()
            .await
            .take()
            .ok_or(ServerError::AlreadyRunning)?;
        tokio::spawn(consume_timeouts(Arc::downgrade(&self), timeouts));

        log::info!(
            "VTun server run on {} with device {}",
            self.transport.local_addr()?,
            self.device.name()
        );

        tokio::select! {
            result = self.receive_loop() => result,
            result = self.device_loop() => result,
        }
    }

    /// 关闭所有端点并通知对端
    pub async fn shutdown(&self) {
        log::info!("Teardown server, send FIN to all endpoints");
        for endpoint in self.registry.list().await {
            self.close_endpoint(endpoint.address(), CloseReason::Shutdown)
                .await;
        }
    }

    /// 关闭端点，可以重复调用
    pub async fn close_endpoint(&self, ip: Ipv4Addr, reason: CloseReason) -> Option<Endpoint> {
        self.heartbeat.stop(ip).await;
        let routes = self.routes.remove_routes_of(ip).await;
        let endpoint = self.registry.remove(ip).await?;
        self.finish_close(&endpoint, reason, routes).await;
        Some(endpoint)
    }

    /// 关闭 `expected` 这一次登录，虚拟IP已被新的登录使用时不做任何事
    pub async fn close_endpoint_if_current(
        &self,
        expected: &Endpoint,
        reason: CloseReason,
    ) -> Option<Endpoint> {
        let endpoint = self.registry.remove_if_current(expected).await?;

        // 地址池仍持有该IP，释放前不会有新登录拿到它
        let ip = endpoint.address();
        self.heartbeat.stop(ip).await;
        let routes = self.routes.remove_routes_of(ip).await;
        self.finish_close(&endpoint, reason, routes).await;
        Some(endpoint)
    }

    /// 超时事件处理，过期的事件直接忽略
    async fn on_timeout(&self, timeout: Timeout) {
        // 先记下当前登录再确认代号，确认通过说明期间没有关闭和重新登录
        let current = self.registry.find_by_ip(timeout.ip).await;
        if !self.heartbeat.expire(&timeout).await {
            log::debug!("Ignore stale timeout for ip {}", timeout.ip);
            return;
        }

        let Some(endpoint) = current else {
            return;
        };

        log::info!("Heartbeat timeout endpoint ip {}, close it", timeout.ip);
        self.close_endpoint_if_current(&endpoint, CloseReason::HeartbeatTimeout)
            .await;
    }

    async fn finish_close(&self, endpoint: &Endpoint, reason: CloseReason, routes: usize) {
        self.pool.release(endpoint.address());
        self.credentials.logout(&endpoint.user);

        if reason != CloseReason::PeerFin {
            self.send(Flag::Fin, &[], endpoint.remote).await;
        }

        log::info!(
            "Endpoint {} user {} ip {} closed ({}), {} routes removed",
            endpoint.remote,
            endpoint.user,
            endpoint.ip,
            reason,
            routes
        );
    }

    async fn receive_loop(&self) -> Result<(), ServerError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let (n, remote) = self.transport.recv_from(&mut buf).await?;

            let (flag, payload) = match self.transport.decode(&buf[..n]) {
                Ok(packet) => packet,
                Err(e) => {
                    log::warn!("Parse packet from {} failed: {}", remote, e);
                    continue;
                }
            };

            self.dispatch(flag, payload, remote).await;
        }
    }

    async fn device_loop(&self) -> Result<(), ServerError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let n = self.device.read(&mut buf).await?;
            let packet = &buf[..n];

            let Some(dst) = ipv4_destination(packet) else {
                continue;
            };

            match self.routes.route_for(dst).await {
                Some(endpoint) => self.send(Flag::Dat, packet, endpoint.remote).await,
                None => log::debug!("No endpoint for {}, drop it", dst),
            }
        }
    }

    async fn dispatch(&self, flag: Flag, payload: Vec<u8>, remote: SocketAddr) {
        match flag {
            Flag::Req => self.handle_req(&payload, remote).await,
            Flag::Psh => self.handle_psh(remote).await,
            Flag::Dat => self.handle_dat(&payload, remote).await,
            Flag::Fin => self.handle_fin(remote).await,
            Flag::Ips => self.handle_ips(&payload, remote).await,
            Flag::Ack | Flag::Unknown(_) => {
                log::debug!("Ignore {} packet from {}", flag, remote)
            }
        }
    }

    async fn handle_req(&self, payload: &[u8], remote: SocketAddr) {
        let msg = match self.login(payload, remote).await {
            Ok(endpoint) => {
                log::info!(
                    "Remote {} login with user {} assign ip {}",
                    remote,
                    endpoint.user,
                    endpoint.ip
                );
                endpoint.ip.to_string()
            }
            Err(e) => {
                log::error!("Login from remote {} failed: {}", remote, e);
                e.to_string()
            }
        };

        self.send(Flag::Ack, msg.as_bytes(), remote).await;
    }

    async fn login(&self, payload: &[u8], remote: SocketAddr) -> Result<Endpoint, LoginError> {
        let request = String::from_utf8_lossy(payload);
        let parts: Vec<&str> = request.split('/').collect();
        let [user, passwd] = parts.as_slice() else {
            return Err(LoginError::InvalidRequest);
        };

        self.credentials.validate(user, passwd)?;

        match self.lease_and_register(user, remote).await {
            Ok(endpoint) => {
                self.heartbeat.start(endpoint.address()).await;
                Ok(endpoint)
            }
            Err(e) => {
                self.credentials.logout(user);
                Err(e)
            }
        }
    }

    async fn lease_and_register(
        &self,
        user: &str,
        remote: SocketAddr,
    ) -> Result<Endpoint, LoginError> {
        let addr = self.pool.lease_for(user)?;

        let registered = match Ipv4Net::new(addr, self.pool.prefix_len()) {
            Ok(ip) => self
                .registry
                .create(remote, user, ip)
                .await
                .map_err(LoginError::from),
            Err(_) => Err(PoolError::InvalidPrefix(self.pool.prefix_len()).into()),
        };

        if registered.is_err() {
            self.pool.release(addr);
        }
        registered
    }

    async fn handle_psh(&self, remote: SocketAddr) {
        let Some(endpoint) = self.registry.find_by_address(&remote).await else {
            log::debug!("Heartbeat from unknown remote {}", remote);
            return;
        };

        self.heartbeat.beat(endpoint.address()).await;
        self.send(Flag::Psh, &[], remote).await;
    }

    async fn handle_dat(&self, packet: &[u8], remote: SocketAddr) {
        if self.registry.find_by_address(&remote).await.is_none() {
            log::warn!("Drop data from unknown remote {}", remote);
            return;
        }

        let Some(dst) = ipv4_destination(packet) else {
            log::debug!("Drop non ipv4 data from {}", remote);
            return;
        };

        match self.routes.route_for(dst).await {
            Some(endpoint) => self.send(Flag::Dat, packet, endpoint.remote).await,
            None => {
                if let Err(e) = self.device.write(packet).await {
                    log::error!("Write to device {} failed: {}", self.device.name(), e);
                }
            }
        }
    }

    async fn handle_fin(&self, remote: SocketAddr) {
        match self.registry.find_by_address(&remote).await {
            Some(endpoint) => {
                self.close_endpoint(endpoint.address(), CloseReason::PeerFin)
                    .await;
            }
            None => log::debug!("FIN from unknown remote {}", remote),
        }
    }

    async fn handle_ips(&self, payload: &[u8], remote: SocketAddr) {
        let Some(endpoint) = self.registry.find_by_address(&remote).await else {
            log::debug!("Allowed ips from unknown remote {}", remote);
            return;
        };

        let cidrs = match parse_allowed_ips(&String::from_utf8_lossy(payload)) {
            Ok(cidrs) => cidrs,
            Err(e) => {
                log::warn!("Invalid allowed ips from {}: {}", remote, e);
                return;
            }
        };
        self.routes.add_routes(endpoint.address(), &cidrs).await;
        log::info!(
            "Endpoint {} ip {} allowed ips {:?}",
            remote,
            endpoint.ip,
            cidrs
        );
    }

    async fn send(&self, flag: Flag, payload: &[u8], remote: SocketAddr) {
        if let Err(e) = self.transport.send_to(flag, payload, remote).await {
            log::warn!("Send {} to {} failed: {}", flag, remote, e);
        }
    }
}

/// 超时清理任务，服务释放后退出
async fn consume_timeouts(server: Weak<TunnelServer>, mut timeouts: mpsc::Receiver<Timeout>) {
    while let Some(timeout) = timeouts.recv().await {
        let Some(server) = server.upgrade() else {
            return;
        };

        server.on_timeout(timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::FileCredentialStore;
    use vtun::{Cipher, CipherKind, MemoryDevice};

    async fn server(ip_range: &str) -> (tempfile::TempDir, Arc<TunnelServer>) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("users"));
        store.add("alice", "secret1234").unwrap();
        store.add("bob", "hunter2").unwrap();

        let cipher = Cipher::new(CipherKind::None, b"").unwrap();
        let transport = Transport::bind("127.0.0.1:0".parse().unwrap(), cipher)
            .await
            .unwrap();
        let (device, _handle) = MemoryDevice::new("vtun0");

        let server = TunnelServer::new(
            transport,
            Arc::new(device),
            Arc::new(store),
            ServerOptions {
                local: "192.168.123.1/24".parse().unwrap(),
                ip_range: ip_range.to_string(),
                heartbeat_timeout: Duration::from_secs(30),
            },
        )
        .unwrap();
        (dir, server)
    }

    fn remote(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn login_registers_endpoint() {
        let (_dir, server) = server("192.168.123.100-192.168.123.110").await;
        let endpoint = server.login(b"alice/secret1234", remote(4000)).await.unwrap();

        assert_eq!(endpoint.ip.prefix_len(), 24);
        assert!(server.pool.is_leased(endpoint.address()));
        assert!(server.heartbeat.is_monitoring(endpoint.address()).await);
        assert_eq!(server.pool.used_count(), 1);
    }

    #[tokio::test]
    async fn malformed_request() {
        let (_dir, server) = server("192.168.123.100-192.168.123.110").await;
        for payload in [&b"alice"[..], b"alice/secret1234/x", b""] {
            let err = server.login(payload, remote(4000)).await.unwrap_err();
            assert_eq!(err.to_string(), "invalid REQ msg");
        }
    }

    #[tokio::test]
    async fn exhausted_pool_rolls_back_login() {
        let (_dir, server) = server("192.168.123.100-192.168.123.101").await;
        server.login(b"alice/secret1234", remote(4000)).await.unwrap();

        let err = server.login(b"bob/hunter2", remote(4001)).await.unwrap_err();
        assert!(matches!(err, LoginError::Pool(PoolError::PoolExhausted)));

        // bob 没有残留登录状态
        server
            .close_endpoint("192.168.123.100".parse().unwrap(), CloseReason::PeerFin)
            .await
            .unwrap();
        server.login(b"bob/hunter2", remote(4001)).await.unwrap();
    }

    #[tokio::test]
    async fn registered_remote_rolls_back_lease() {
        let (_dir, server) = server("192.168.123.100-192.168.123.110").await;
        server.login(b"alice/secret1234", remote(4000)).await.unwrap();

        let err = server.login(b"bob/hunter2", remote(4000)).await;
        assert!(matches!(
            err,
            Err(LoginError::Registry(RegistryError::EndpointExists { .. }))
        ));
        assert_eq!(server.pool.used_count(), 1);
    }

    #[tokio::test]
    async fn close_endpoint_is_idempotent() {
        let (_dir, server) = server("192.168.123.100-192.168.123.110").await;
        let endpoint = server.login(b"alice/secret1234", remote(4000)).await.unwrap();
        server
            .routes
            .add_routes(endpoint.address(), &["10.66.0.0/16".parse().unwrap()])
            .await;

        let closed = server
            .close_endpoint(endpoint.address(), CloseReason::PeerFin)
            .await;
        assert_eq!(closed, Some(endpoint.clone()));
        assert!(server
            .close_endpoint(endpoint.address(), CloseReason::PeerFin)
            .await
            .is_none());

        assert!(server.registry.is_empty().await);
        assert!(server.routes.routes().await.is_empty());
        assert_eq!(server.pool.used_count(), 0);
        assert!(!server.heartbeat.is_monitoring(endpoint.address()).await);
    }

    #[tokio::test]
    async fn stale_timeout_spares_new_session_on_same_ip() {
        let (_dir, server) = server("192.168.123.100-192.168.123.110").await;
        let old = server.login(b"alice/secret1234", remote(4000)).await.unwrap();
        let ip = old.address();

        // 超时事件已确认，此时对端先FIN再从新端口登录
        let generation = server.heartbeat.start(ip).await;
        assert!(server.heartbeat.expire(&Timeout { ip, generation }).await);
        server.handle_fin(remote(4000)).await;
        let new = server.login(b"alice/secret1234", remote(4001)).await.unwrap();
        assert_eq!(new.address(), ip);
        server
            .routes
            .add_routes(ip, &["10.66.0.0/16".parse().unwrap()])
            .await;

        assert!(server
            .close_endpoint_if_current(&old, CloseReason::HeartbeatTimeout)
            .await
            .is_none());
        assert_eq!(server.registry.find_by_ip(ip).await, Some(new.clone()));
        assert!(server.heartbeat.is_monitoring(ip).await);
        assert_eq!(server.routes.routes_of(ip).await.len(), 1);
        assert!(server.pool.is_leased(ip));
    }

    #[tokio::test]
    async fn timeout_event_closes_only_current_generation() {
        let (_dir, server) = server("192.168.123.100-192.168.123.110").await;
        let endpoint = server.login(b"alice/secret1234", remote(4000)).await.unwrap();
        let ip = endpoint.address();

        let stale = server.heartbeat.start(ip).await;
        let current = server.heartbeat.start(ip).await;

        server.on_timeout(Timeout { ip, generation: stale }).await;
        assert!(server.registry.find_by_ip(ip).await.is_some());
        assert!(server.heartbeat.is_monitoring(ip).await);

        server.on_timeout(Timeout { ip, generation: current }).await;
        assert!(server.registry.is_empty().await);
        assert!(!server.pool.is_leased(ip));
        assert!(!server.heartbeat.is_monitoring(ip).await);

        // 用户已退出登录，可以再次登录
        server.login(b"alice/secret1234", remote(4001)).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_allowed_ips_register_nothing() {
        let (_dir, server) = server("192.168.123.100-192.168.123.110").await;
        let endpoint = server.login(b"alice/secret1234", remote(4000)).await.unwrap();

        server
            .handle_ips(b"10.66.0.0/16,not-a-cidr", remote(4000))
            .await;
        assert!(server.routes.routes().await.is_empty());

        server
            .handle_ips(b"10.66.0.0/16,10.67.0.0/16", remote(4000))
            .await;
        assert_eq!(server.routes.routes_of(endpoint.address()).await.len(), 2);
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let (_dir, server) = server("192.168.123.100-192.168.123.110").await;
        server.timeouts.lock().await.take();
        assert!(matches!(
            server.clone().run().await,
            Err(ServerError::AlreadyRunning)
        ));
    }
}
