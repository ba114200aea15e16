/*!
VTun网络模块

封装隧道使用的UDP套接字，包括：
- 数据包的编码和发送
- 数据报的接收和解码
*/

use crate::crypto::Cipher;
use crate::protocol::{self, CodecError, Flag};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::UdpSocket;

/// 网络错误
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// 带加密的UDP传输
#[derive(Debug)]
pub struct Transport {
    socket: UdpSocket,
    cipher: Cipher,
}

impl Transport {
    pub fn new(socket: UdpSocket, cipher: Cipher) -> Self {
        Self { socket, cipher }
    }

    /// 绑定本地地址
    pub async fn bind(addr: SocketAddr, cipher: Cipher) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::new(socket, cipher))
    }

    /// 绑定任意本地端口并连接到远端
    pub async fn connect(target: SocketAddr, cipher: Cipher) -> Result<Self, TransportError> {
        let local: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok(Self::new(socket, cipher))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    /// 发送数据包到指定地址
    pub async fn send_to(
        &self,
        flag: Flag,
        payload: &[u8],
        addr: SocketAddr,
    ) -> Result<(), TransportError> {
        let stream = protocol::encode(flag, payload, &self.cipher)?;
        self.socket.send_to(&stream, addr).await?;
        Ok(())
    }

    /// 通过已连接的套接字发送数据包
    pub async fn send(&self, flag: Flag, payload: &[u8]) -> Result<(), TransportError> {
        let stream = protocol::encode(flag, payload, &self.cipher)?;
        self.socket.send(&stream).await?;
        Ok(())
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }

    /// 解码收到的数据报
    pub fn decode(&self, data: &[u8]) -> Result<(Flag, Vec<u8>), CodecError> {
        protocol::decode(data, &self.cipher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherKind;
    use crate::protocol::MAX_FRAGMENT_SIZE;

    fn aes() -> Cipher {
        Cipher::new(CipherKind::Aes, b"0123456789ABCDEF").unwrap()
    }

    #[tokio::test]
    async fn send_and_decode_between_sockets() {
        let server = Transport::bind("127.0.0.1:0".parse().unwrap(), aes())
            .await
            .unwrap();
        let client = Transport::connect(server.local_addr().unwrap(), aes())
            .await
            .unwrap();

        client.send(Flag::Req, b"alice/secret").await.unwrap();

        let mut buf = vec![0u8; MAX_FRAGMENT_SIZE];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, client.local_addr().unwrap());
        assert_eq!(
            server.decode(&buf[..n]).unwrap(),
            (Flag::Req, b"alice/secret".to_vec())
        );

        server.send_to(Flag::Ack, b"10.0.0.2/24", from).await.unwrap();
        let n = client.recv(&mut buf).await.unwrap();
        assert_eq!(
            client.decode(&buf[..n]).unwrap(),
            (Flag::Ack, b"10.0.0.2/24".to_vec())
        );
    }

    #[tokio::test]
    async fn mismatched_cipher_fails_to_decode() {
        let server = Transport::bind(
            "127.0.0.1:0".parse().unwrap(),
            Cipher::new(CipherKind::None, b"").unwrap(),
        )
        .await
        .unwrap();
        let client = Transport::connect(server.local_addr().unwrap(), aes())
            .await
            .unwrap();

        client.send(Flag::Dat, &[1u8; 5]).await.unwrap();

        let mut buf = vec![0u8; MAX_FRAGMENT_SIZE];
        let (n, _) = server.recv_from(&mut buf).await.unwrap();
        let (_, payload) = server.decode(&buf[..n]).unwrap();
        assert_ne!(payload, vec![1u8; 5]);
    }
}
