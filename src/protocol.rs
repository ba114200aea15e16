/*!
VTun协议模块

定义VTun的隧道协议，包括：
- 控制标志位
- 数据包结构（头部 + 加密负载 + 填充）
- 编码和解码
- 协议常量

线路格式（大端序）：

```text
0..2   flag         u16  (0x1b00 | bit)
2..4   payload len  u16
4..6   noise len    u16
6..    payload      加密后的负载
..     noise        填充
```
*/

use crate::crypto::{Cipher, CipherError};
use rand::RngCore;
use std::fmt;
use thiserror::Error;

/// 头部长度
pub const HEADER_LEN: usize = 6;

/// 最小负载长度，不足时用填充补齐
pub const MIN_PAYLOAD_LEN: usize = 12;

/// 最大分片长度
pub const MAX_FRAGMENT_SIZE: usize = 4096;

/// 可解码的最小分片长度
pub const MIN_FRAGMENT_SIZE: usize = HEADER_LEN + MIN_PAYLOAD_LEN;

const FLAG_TAG: u16 = 0x1b00;

/// 协议错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid data fragment of {0} bytes")]
    MalformedFrame(usize),

    #[error("payload of {0} bytes is too large")]
    PayloadTooLarge(usize),

    #[error("decrypt data {0}")]
    Decrypt(CipherError),

    #[error("encrypt data {0}")]
    Encrypt(CipherError),
}

/// 控制标志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// 登录请求，负载为 `<user>/<passwd>`
    Req,
    /// 登录响应，负载为分配的地址或错误信息
    Ack,
    /// 心跳
    Psh,
    /// 数据
    Dat,
    /// 关闭连接
    Fin,
    /// 同步 allowed-ips，负载为逗号分隔的CIDR
    Ips,
    /// 未知标志
    Unknown(u16),
}

impl Flag {
    /// 线路上的16位编码
    pub const fn bits(self) -> u16 {
        match self {
            Flag::Req => FLAG_TAG | 0x01,
            Flag::Ack => FLAG_TAG | (0x01 << 1),
            Flag::Psh => FLAG_TAG | (0x01 << 2),
            Flag::Dat => FLAG_TAG | (0x01 << 3),
            Flag::Fin => FLAG_TAG | (0x01 << 4),
            Flag::Ips => FLAG_TAG | (0x01 << 5),
            Flag::Unknown(bits) => bits,
        }
    }
}

impl From<u16> for Flag {
    fn from(bits: u16) -> Self {
        [Flag::Req, Flag::Ack, Flag::Psh, Flag::Dat, Flag::Fin, Flag::Ips]
            .into_iter()
            .find(|flag| flag.bits() == bits)
            .unwrap_or(Flag::Unknown(bits))
    }
}

impl From<Flag> for u16 {
    fn from(flag: Flag) -> Self {
        flag.bits()
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Req => write!(f, "REQ"),
            Flag::Ack => write!(f, "ACK"),
            Flag::Psh => write!(f, "PSH"),
            Flag::Dat => write!(f, "DAT"),
            Flag::Fin => write!(f, "FIN"),
            Flag::Ips => write!(f, "IPS"),
            Flag::Unknown(bits) => write!(f, "UNKNOWN({:#06x})", bits),
        }
    }
}

/// VTun数据包
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flag: Flag,
    pub payload: Vec<u8>, // 加密后的负载
    pub noise: Vec<u8>,   // 填充
}

impl Packet {
    /// 构建数据包，非空负载先加密
    ///
    /// 填充长度按明文长度计算，头部记录的是密文长度。
    pub fn new(flag: Flag, payload: &[u8], cipher: &Cipher) -> Result<Self, CodecError> {
        let encrypted = cipher.encrypt(payload).map_err(CodecError::Encrypt)?;
        if encrypted.len() > u16::MAX as usize {
            return Err(CodecError::PayloadTooLarge(encrypted.len()));
        }

        let mut noise = vec![0u8; MIN_PAYLOAD_LEN.saturating_sub(payload.len())];
        rand::thread_rng().fill_bytes(&mut noise);

        Ok(Self {
            flag,
            payload: encrypted,
            noise,
        })
    }

    /// 序列化为线路格式
    pub fn encode(&self) -> Vec<u8> {
        let mut stream = Vec::with_capacity(HEADER_LEN + self.payload.len() + self.noise.len());
        stream.extend_from_slice(&self.flag.bits().to_be_bytes());
        stream.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        stream.extend_from_slice(&(self.noise.len() as u16).to_be_bytes());
        stream.extend_from_slice(&self.payload);
        stream.extend_from_slice(&self.noise);
        stream
    }
}

/// 编码数据包
pub fn encode(flag: Flag, payload: &[u8], cipher: &Cipher) -> Result<Vec<u8>, CodecError> {
    Ok(Packet::new(flag, payload, cipher)?.encode())
}

/// 解码数据包，返回标志和解密后的负载
pub fn decode(stream: &[u8], cipher: &Cipher) -> Result<(Flag, Vec<u8>), CodecError> {
    if stream.len() < MIN_FRAGMENT_SIZE {
        return Err(CodecError::MalformedFrame(stream.len()));
    }

    let flag = Flag::from(u16::from_be_bytes([stream[0], stream[1]]));
    let payload_len = u16::from_be_bytes([stream[2], stream[3]]) as usize;
    let noise_len = u16::from_be_bytes([stream[4], stream[5]]) as usize;

    if stream.len() != HEADER_LEN + payload_len + noise_len {
        return Err(CodecError::MalformedFrame(stream.len()));
    }

    if payload_len == 0 {
        return Ok((flag, Vec::new()));
    }

    let payload = cipher
        .decrypt(&stream[HEADER_LEN..HEADER_LEN + payload_len])
        .map_err(CodecError::Decrypt)?;

    Ok((flag, payload))
}
