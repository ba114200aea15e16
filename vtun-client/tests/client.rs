use ipnet::Ipv4Net;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use vtun::{Cipher, CipherKind, Flag, MemoryDevice, Transport, TunDevice, MAX_PACKET_SIZE};
use vtun_client::{ClientError, ClientOptions, ClientState, TunnelClient};

const KEY: &[u8] = b"0123456789ABCDEF";

fn cipher() -> Cipher {
    Cipher::new(CipherKind::Aes, KEY).unwrap()
}

/// 按脚本应答的服务端
struct FakeServer {
    transport: Transport,
    buf: Vec<u8>,
}

impl FakeServer {
    async fn bind() -> Self {
        Self {
            transport: Transport::bind("127.0.0.1:0".parse().unwrap(), cipher())
                .await
                .unwrap(),
            buf: vec![0u8; MAX_PACKET_SIZE],
        }
    }

    fn addr(&self) -> SocketAddr {
        self.transport.local_addr().unwrap()
    }

    async fn recv(&mut self) -> (Flag, Vec<u8>, SocketAddr) {
        let (n, from) = self.transport.recv_from(&mut self.buf).await.unwrap();
        let (flag, payload) = self.transport.decode(&self.buf[..n]).unwrap();
        (flag, payload, from)
    }

    /// 跳过心跳，返回下一个其他数据包
    async fn recv_skip_psh(&mut self) -> (Flag, Vec<u8>, SocketAddr) {
        loop {
            let packet = self.recv().await;
            if packet.0 != Flag::Psh {
                return packet;
            }
        }
    }

    async fn send(&self, flag: Flag, payload: &[u8], to: SocketAddr) {
        self.transport.send_to(flag, payload, to).await.unwrap();
    }
}

fn options() -> ClientOptions {
    let mut options = ClientOptions::new("alice", "secret1234");
    options.allowed_ips = vec!["10.1.0.0/16".parse().unwrap(), "10.2.0.0/24".parse().unwrap()];
    options
}

async fn login(server: &mut FakeServer, options: ClientOptions) -> (Arc<TunnelClient>, SocketAddr) {
    let client = Arc::new(
        TunnelClient::connect(server.addr(), cipher(), options)
            .await
            .unwrap(),
    );

    let handshake = {
        let client = client.clone();
        tokio::spawn(async move { client.handshake().await })
    };

    let (flag, payload, from) = server.recv().await;
    assert_eq!(flag, Flag::Req);
    assert_eq!(payload, b"alice/secret1234");
    server.send(Flag::Ack, b"192.168.123.100/24", from).await;

    let lease = handshake.await.unwrap().unwrap();
    assert_eq!(lease, "192.168.123.100/24".parse::<Ipv4Net>().unwrap());
    (client, from)
}

#[tokio::test]
async fn handshake_announces_allowed_ips() {
    let mut server = FakeServer::bind().await;
    let (client, _) = login(&mut server, options()).await;

    assert_eq!(client.state().await, ClientState::Connected);
    assert_eq!(
        client.lease().await,
        Some("192.168.123.100/24".parse::<Ipv4Net>().unwrap())
    );

    let (flag, payload, _) = server.recv().await;
    assert_eq!(flag, Flag::Ips);
    assert_eq!(payload, b"10.1.0.0/16,10.2.0.0/24");
}

#[tokio::test]
async fn handshake_rejected_with_error_message() {
    let mut server = FakeServer::bind().await;
    let client = Arc::new(
        TunnelClient::connect(server.addr(), cipher(), options())
            .await
            .unwrap(),
    );

    let handshake = {
        let client = client.clone();
        tokio::spawn(async move { client.handshake().await })
    };

    let (_, _, from) = server.recv().await;
    server.send(Flag::Psh, &[], from).await;
    server
        .send(Flag::Ack, b"wrong passwd for user alice", from)
        .await;

    match handshake.await.unwrap() {
        Err(ClientError::AuthRejected(msg)) => assert_eq!(msg, "wrong passwd for user alice"),
        other => panic!("unexpected handshake result {:?}", other),
    }
    assert_eq!(client.state().await, ClientState::Closed);
}

#[tokio::test]
async fn handshake_times_out_without_ack() {
    let server = FakeServer::bind().await;
    let mut options = options();
    options.auth_timeout = Duration::from_millis(200);

    let client = TunnelClient::connect(server.addr(), cipher(), options)
        .await
        .unwrap();
    assert!(matches!(
        client.handshake().await,
        Err(ClientError::AuthTimeout)
    ));
    assert_eq!(client.state().await, ClientState::Closed);
}

#[tokio::test]
async fn run_requires_connection() {
    let server = FakeServer::bind().await;
    let client = TunnelClient::connect(server.addr(), cipher(), options())
        .await
        .unwrap();
    let (device, _handle) = MemoryDevice::new("vtun0");

    assert!(matches!(
        client.run(Arc::new(device)).await,
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn forwards_data_until_fin() {
    let mut server = FakeServer::bind().await;
    let mut options = options();
    options.allowed_ips.clear();
    options.heartbeat_interval = Duration::from_millis(50);
    let (client, from) = login(&mut server, options).await;

    let (device, mut handle) = MemoryDevice::new("vtun0");
    let running = {
        let client = client.clone();
        tokio::spawn(async move { client.run(Arc::new(device)).await })
    };

    // 客户端周期发送心跳
    let (flag, _, _) = server.recv().await;
    assert_eq!(flag, Flag::Psh);

    // 服务端到设备
    server.send(Flag::Dat, b"downlink packet", from).await;
    assert_eq!(handle.next_written().await.unwrap(), b"downlink packet");

    // 设备到服务端
    handle.inject(b"uplink packet".to_vec()).await;
    let (flag, payload, _) = server.recv_skip_psh().await;
    assert_eq!(flag, Flag::Dat);
    assert_eq!(payload, b"uplink packet");

    server.send(Flag::Fin, &[], from).await;
    running.await.unwrap().unwrap();
    assert_eq!(client.state().await, ClientState::Closed);
}

#[tokio::test]
async fn silent_server_is_fatal() {
    let mut server = FakeServer::bind().await;
    let mut options = options();
    options.allowed_ips.clear();
    options.silence_timeout = Duration::from_millis(300);
    let (client, _) = login(&mut server, options).await;

    let (device, _handle) = MemoryDevice::new("vtun0");
    assert!(matches!(
        client.run(Arc::new(device)).await,
        Err(ClientError::HeartbeatTimeout)
    ));
}

#[tokio::test]
async fn close_sends_fin() {
    let mut server = FakeServer::bind().await;
    let mut options = options();
    options.allowed_ips.clear();
    let (client, _) = login(&mut server, options).await;

    client.close().await.unwrap();
    let (flag, payload, _) = server.recv().await;
    assert_eq!(flag, Flag::Fin);
    assert!(payload.is_empty());
    assert_eq!(client.state().await, ClientState::Closed);

    // 已关闭时不再发送
    client.close().await.unwrap();
}

#[tokio::test]
async fn failed_device_sends_fin() {
    let mut server = FakeServer::bind().await;
    let mut options = options();
    options.allowed_ips.clear();
    let (client, _) = login(&mut server, options).await;

    let lease = client.lease().await.unwrap();
    let result = client
        .attach_device(lease, |_| async {
            Err::<Arc<dyn TunDevice>, _>(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no tun",
            ))
        })
        .await;
    assert!(matches!(result, Err(ClientError::Device(_))));

    let (flag, _, _) = server.recv().await;
    assert_eq!(flag, Flag::Fin);
    assert_eq!(client.state().await, ClientState::Closed);
}

#[tokio::test]
async fn attached_device_is_returned() {
    let mut server = FakeServer::bind().await;
    let mut options = options();
    options.allowed_ips.clear();
    let (client, _) = login(&mut server, options).await;

    let lease = client.lease().await.unwrap();
    let device = client
        .attach_device(lease, |_| async {
            let (device, _handle) = MemoryDevice::new("vtun0");
            Ok(Arc::new(device) as Arc<dyn TunDevice>)
        })
        .await
        .unwrap();
    assert_eq!(device.name(), "vtun0");
    assert_eq!(client.state().await, ClientState::Connected);
}
