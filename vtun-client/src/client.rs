/*!
VTun Client 客户端模块

隧道客户端，包括：
- 登录握手（REQ / ACK）
- allowed-ips 宣告
- 周期心跳和接收超时检测
- 虚拟设备和服务端之间的数据转发
*/

use ipnet::Ipv4Net;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use vtun::{Cipher, Flag, Transport, TransportError, TunDevice, MAX_PACKET_SIZE};

/// 心跳间隔
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// 登录超时
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// 接收超时，期间没有收到服务端任何数据则断开
pub const SILENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// 客户端错误
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("device error: {0}")]
    Device(io::Error),

    #[error("login timeout")]
    AuthTimeout,

    #[error("login rejected: {0}")]
    AuthRejected(String),

    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    #[error("client is not connected")]
    NotConnected,
}

/// 客户端状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    AwaitingAck,
    Connected,
    Closed,
}

/// 客户端参数
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub user: String,
    pub passwd: String,
    pub allowed_ips: Vec<Ipv4Net>,
    pub heartbeat_interval: Duration,
    pub auth_timeout: Duration,
    pub silence_timeout: Duration,
}

impl ClientOptions {
    pub fn new(user: &str, passwd: &str) -> Self {
        Self {
            user: user.to_string(),
            passwd: passwd.to_string(),
            allowed_ips: Vec::new(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            auth_timeout: AUTH_TIMEOUT,
            silence_timeout: SILENCE_TIMEOUT,
        }
    }
}

/// 隧道客户端
pub struct TunnelClient {
    transport: Arc<Transport>,
    options: ClientOptions,
    state: Mutex<ClientState>,
    lease: Mutex<Option<Ipv4Net>>,
}

impl TunnelClient {
    pub fn new(transport: Transport, options: ClientOptions) -> Self {
        Self {
            transport: Arc::new(transport),
            options,
            state: Mutex::new(ClientState::Disconnected),
            lease: Mutex::new(None),
        }
    }

    /// 连接到服务端
    pub async fn connect(
        target: SocketAddr,
        cipher: Cipher,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let transport = Transport::connect(target, cipher).await?;
        Ok(Self::new(transport, options))
    }

    pub async fn state(&self) -> ClientState {
        *self.state.lock().await
    }

    /// 服务端分配的地址
    pub async fn lease(&self) -> Option<Ipv4Net> {
        *self.lease.lock().await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    async fn set_state(&self, state: ClientState) {
        let mut current = self.state.lock().await;
        if *current != state {
            log::debug!("Client state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// 登录，成功后返回分配的地址
    pub async fn handshake(&self) -> Result<Ipv4Net, ClientError> {
        self.set_state(ClientState::AwaitingAck).await;

        let request = format!("{}/{}", self.options.user, self.options.passwd);
        self.transport.send(Flag::Req, request.as_bytes()).await?;

        let msg = match time::timeout(self.options.auth_timeout, self.wait_ack()).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                self.set_state(ClientState::Closed).await;
                return Err(e);
            }
            Err(_) => {
                log::error!("No ACK from server within {:?}", self.options.auth_timeout);
                self.set_state(ClientState::Closed).await;
                return Err(ClientError::AuthTimeout);
            }
        };

        // ACK负载不是地址时就是错误信息
        let lease: Ipv4Net = match msg.parse() {
            Ok(lease) => lease,
            Err(_) => {
                log::error!("Login rejected by server: {}", msg);
                self.set_state(ClientState::Closed).await;
                return Err(ClientError::AuthRejected(msg));
            }
        };

        *self.lease.lock().await = Some(lease);
        self.set_state(ClientState::Connected).await;
        log::info!("Connect to server succeed, endpoint ip {}", lease);

        if !self.options.allowed_ips.is_empty() {
            let allowed_ips = self
                .options
                .allowed_ips
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            self.transport.send(Flag::Ips, allowed_ips.as_bytes()).await?;
            log::info!("Sync allowed ips {}", allowed_ips);
        }

        Ok(lease)
    }

    async fn wait_ack(&self) -> Result<String, ClientError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let n = self.transport.recv(&mut buf).await?;
            match self.transport.decode(&buf[..n]) {
                Ok((Flag::Ack, payload)) => {
                    return Ok(String::from_utf8_lossy(&payload).into_owned())
                }
                Ok((flag, _)) => log::debug!("Ignore {} packet before login", flag),
                Err(e) => log::warn!("Parse packet from server failed: {}", e),
            }
        }
    }

    /// 用分配的地址创建本地设备，失败时向服务端发送FIN
    pub async fn attach_device<F, Fut>(
        &self,
        lease: Ipv4Net,
        open: F,
    ) -> Result<Arc<dyn TunDevice>, ClientError>
    where
        F: FnOnce(Ipv4Net) -> Fut,
        Fut: Future<Output = io::Result<Arc<dyn TunDevice>>>,
    {
        match open(lease).await {
            Ok(device) => {
                log::info!("Virtual device {} started successfully", device.name());
                Ok(device)
            }
            Err(e) => {
                log::error!("Create virtual device with ip {} failed: {}", lease, e);
                if let Err(fin) = self.close().await {
                    log::warn!("Send FIN failed: {}", fin);
                }
                Err(ClientError::Device(e))
            }
        }
    }

    /// 运行隧道，收到FIN时正常返回
    pub async fn run(&self, device: Arc<dyn TunDevice>) -> Result<(), ClientError> {
        if self.state().await != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }

        let result = tokio::select! {
            result = self.receive_loop(device.as_ref()) => result,
            result = self.uplink(device.as_ref()) => result,
            result = self.heartbeats() => result,
        };

        if let Err(e) = &result {
            log::error!("Tunnel stopped: {}", e);
        }
        self.set_state(ClientState::Closed).await;
        result
    }

    /// 发送FIN并关闭
    pub async fn close(&self) -> Result<(), ClientError> {
        let state = self.state().await;
        if state == ClientState::Connected || state == ClientState::AwaitingAck {
            self.transport.send(Flag::Fin, &[]).await?;
            log::info!("Sent FIN to server");
        }

        self.set_state(ClientState::Closed).await;
        Ok(())
    }

    async fn receive_loop(&self, device: &dyn TunDevice) -> Result<(), ClientError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let mut deadline = Instant::now() + self.options.silence_timeout;

        loop {
            let n = match time::timeout_at(deadline, self.transport.recv(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => {
                    log::error!("Monitor heartbeat timeout, exit");
                    return Err(ClientError::HeartbeatTimeout);
                }
            };

            let (flag, payload) = match self.transport.decode(&buf[..n]) {
                Ok(packet) => packet,
                Err(e) => {
                    log::warn!("Parse packet from server failed: {}", e);
                    continue;
                }
            };
            deadline = Instant::now() + self.options.silence_timeout;

            match flag {
                Flag::Dat => {
                    device.write(&payload).await.map_err(ClientError::Device)?;
                }
                Flag::Fin => {
                    log::info!("Server closed the connection");
                    return Ok(());
                }
                Flag::Psh => log::debug!("Heartbeat from server"),
                flag => log::debug!("Ignore {} packet", flag),
            }
        }
    }

    async fn uplink(&self, device: &dyn TunDevice) -> Result<(), ClientError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            let n = device.read(&mut buf).await.map_err(ClientError::Device)?;
            if n == 0 {
                continue;
            }

            if let Err(e) = self.transport.send(Flag::Dat, &buf[..n]).await {
                log::error!("Send data to server failed: {}", e);
            }
        }
    }

    async fn heartbeats(&self) -> Result<(), ClientError> {
        let mut ticker = time::interval(self.options.heartbeat_interval);
        loop {
            ticker.tick().await;
            match self.transport.send(Flag::Psh, &[]).await {
                Ok(()) => log::debug!("Heartbeat sent"),
                Err(e) => log::error!("Send heartbeat failed: {}", e),
            }
        }
    }
}
