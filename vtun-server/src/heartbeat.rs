/*!
VTun Server 心跳模块

监控每个端点的存活状态，包括：
- 每个端点一个心跳计时器
- 收到心跳时重置计时
- 超时事件通过同一个通道交给清理任务
*/

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

/// 默认心跳超时
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// 超时事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    pub ip: Ipv4Addr,
    /// 计时器的代号，同一IP重新监控后旧事件作废
    pub generation: u64,
}

struct Monitor {
    generation: u64,
    beat: mpsc::Sender<()>,
    stop: oneshot::Sender<()>,
}

/// 心跳监控
pub struct HeartbeatSupervisor {
    timeout: Duration,
    monitors: Mutex<HashMap<Ipv4Addr, Monitor>>,
    generation: AtomicU64,
    timeouts: mpsc::Sender<Timeout>,
}

impl HeartbeatSupervisor {
    /// 创建心跳监控，返回的接收端由唯一的清理任务消费
    pub fn new(timeout: Duration) -> (Self, mpsc::Receiver<Timeout>) {
        let (timeouts, rx) = mpsc::channel(128);
        let supervisor = Self {
            timeout,
            monitors: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            timeouts,
        };

        (supervisor, rx)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 开始监控，已有的计时器先停止。返回新计时器的代号
    pub async fn start(&self, ip: Ipv4Addr) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (beat, mut beat_rx) = mpsc::channel(1);
        let (stop, mut stop_rx) = oneshot::channel();

        let prev = self.monitors.lock().await.insert(
            ip,
            Monitor {
                generation,
                beat,
                stop,
            },
        );
        if let Some(prev) = prev {
            let _ = prev.stop.send(());
        }

        let timeout = self.timeout;
        let timeouts = self.timeouts.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        log::info!("Stop monitor endpoint with ip {}", ip);
                        return;
                    }
                    Some(()) = beat_rx.recv() => continue,
                    _ = tokio::time::sleep(timeout) => {
                        let _ = timeouts.send(Timeout { ip, generation }).await;
                        return;
                    }
                }
            }
        });

        log::debug!("Monitor endpoint with ip {} (generation {})", ip, generation);
        generation
    }

    /// 重置计时，未监控的IP直接忽略
    pub async fn beat(&self, ip: Ipv4Addr) {
        if let Some(monitor) = self.monitors.lock().await.get(&ip) {
            // 通道已满说明还有未处理的心跳
            let _ = monitor.beat.try_send(());
        }
    }

    /// 停止监控，可以重复调用
    pub async fn stop(&self, ip: Ipv4Addr) -> bool {
        match self.monitors.lock().await.remove(&ip) {
            Some(monitor) => {
                let _ = monitor.stop.send(());
                true
            }
            None => false,
        }
    }

    /// 确认超时事件仍属于当前计时器，并移除该计时器
    pub async fn expire(&self, timeout: &Timeout) -> bool {
        let mut monitors = self.monitors.lock().await;
        match monitors.get(&timeout.ip) {
            Some(monitor) if monitor.generation == timeout.generation => {
                monitors.remove(&timeout.ip);
                true
            }
            _ => false,
        }
    }

    pub async fn is_monitoring(&self, ip: Ipv4Addr) -> bool {
        self.monitors.lock().await.contains_key(&ip)
    }
}
