/*!
VTun虚拟设备模块

管理隧道两端的虚拟网络接口，包括：
- 虚拟设备的统一接口
- Linux TUN设备
- 内存设备（测试使用）
- IPv4数据包解析
*/

use async_trait::async_trait;
use pnet::packet::ipv4::Ipv4Packet;
use std::io;
use std::net::Ipv4Addr;
use tokio::sync::{mpsc, Mutex};

#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

/// 虚拟设备
///
/// 读写的都是不带链路层头部的原始IP数据包。
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// 读取一个数据包，返回长度
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// 写入一个数据包
    async fn write(&self, packet: &[u8]) -> io::Result<usize>;

    /// 设备名称
    fn name(&self) -> &str;
}

/// 解析IPv4数据包的目的地址
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    let ip = Ipv4Packet::new(packet)?;
    if ip.get_version() != 4 {
        return None;
    }

    Some(ip.get_destination())
}

/// 内存设备
///
/// 通过 [`MemoryDeviceHandle`] 注入待读取的数据包并观察写入的数据包。
pub struct MemoryDevice {
    name: String,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// 内存设备的另一端
pub struct MemoryDeviceHandle {
    inject: mpsc::Sender<Vec<u8>>,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryDevice {
    pub fn new(name: &str) -> (Self, MemoryDeviceHandle) {
        let (inject, inbound) = mpsc::channel(1024);
        let (outbound, written) = mpsc::unbounded_channel();

        let device = Self {
            name: name.to_string(),
            inbound: Mutex::new(inbound),
            outbound,
        };

        (device, MemoryDeviceHandle { inject, written })
    }
}

#[async_trait]
impl TunDevice for MemoryDevice {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))?;

        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn write(&self, packet: &[u8]) -> io::Result<usize> {
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))?;
        Ok(packet.len())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl MemoryDeviceHandle {
    /// 注入一个数据包，设备下一次读取时返回
    pub async fn inject(&self, packet: Vec<u8>) -> bool {
        self.inject.send(packet).await.is_ok()
    }

    /// 等待下一个写入设备的数据包
    pub async fn next_written(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }

    /// 取出已写入的数据包，不等待
    pub fn try_written(&mut self) -> Option<Vec<u8>> {
        self.written.try_recv().ok()
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::TunDevice;
    use async_trait::async_trait;
    use ipnet::Ipv4Net;
    use nix::libc;
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Write};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use tokio::io::unix::AsyncFd;
    use tokio::process::Command;

    const IFNAMSIZ: usize = 16;

    #[repr(C)]
    struct IfReq {
        name: [u8; IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    nix::ioctl_readwrite_bad!(
        tun_set_iff,
        nix::request_code_write!(b'T', 202, std::mem::size_of::<libc::c_int>()),
        IfReq
    );

    /// Linux TUN设备
    pub struct LinuxTun {
        fd: AsyncFd<File>,
        name: String,
    }

    impl LinuxTun {
        /// 创建TUN设备，名称为空时由内核分配
        pub fn open(name: &str) -> io::Result<Self> {
            if name.len() >= IFNAMSIZ {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("interface name {} is too long", name),
                ));
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open("/dev/net/tun")?;

            let mut req = IfReq {
                name: [0u8; IFNAMSIZ],
                flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
                _pad: [0u8; 22],
            };
            req.name[..name.len()].copy_from_slice(name.as_bytes());

            // SAFETY: req 是有效的 ifreq 结构，fd 在调用期间保持打开
            unsafe { tun_set_iff(file.as_raw_fd(), &mut req) }.map_err(io::Error::from)?;

            let len = req.name.iter().position(|b| *b == 0).unwrap_or(IFNAMSIZ);
            let name = String::from_utf8_lossy(&req.name[..len]).into_owned();

            Ok(Self {
                fd: AsyncFd::new(file)?,
                name,
            })
        }

        /// 配置设备地址和MTU并启用
        pub async fn configure(&self, addr: Ipv4Net, mtu: u32) -> io::Result<()> {
            log::info!("Configuring interface {} with IP: {}", self.name, addr);
            ip(&["addr", "add", &addr.to_string(), "dev", &self.name]).await?;
            ip(&["link", "set", "dev", &self.name, "mtu", &mtu.to_string(), "up"]).await
        }
    }

    async fn ip(args: &[&str]) -> io::Result<()> {
        let status = Command::new("ip").args(args).status().await?;
        if status.success() {
            return Ok(());
        }

        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("ip {} exited with {}", args.join(" "), status),
        ))
    }

    #[async_trait]
    impl TunDevice for LinuxTun {
        async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| {
                    let mut file = inner.get_ref();
                    file.read(buf)
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        async fn write(&self, packet: &[u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| {
                    let mut file = inner.get_ref();
                    file.write(packet)
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        fn name(&self) -> &str {
            &self.name
        }
    }
}
