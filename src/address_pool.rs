/*!
VTun地址池模块

为登录的用户分配虚拟IP地址，包括：
- 地址范围解析
- 按用户名确定起始位置的分配
- 地址释放
*/

use ring::digest;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use thiserror::Error;

/// 地址池错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid ip range {0}")]
    InvalidRange(String),

    #[error("invalid prefix length {0}")]
    InvalidPrefix(u8),

    #[error("no available ip")]
    PoolExhausted,
}

/// 地址池
///
/// 范围 `start-end` 包含 `end - start` 个地址，`end` 本身不分配。
#[derive(Debug)]
pub struct AddressPool {
    start: u32,
    count: u32,
    prefix_len: u8,
    used: Mutex<BTreeSet<u32>>,
}

impl AddressPool {
    /// 从 `"<start>-<end>"` 创建地址池，分配出的地址使用 `prefix_len` 作为前缀长度
    pub fn new(range: &str, prefix_len: u8) -> Result<Self, PoolError> {
        if prefix_len > 32 {
            return Err(PoolError::InvalidPrefix(prefix_len));
        }

        let invalid = || PoolError::InvalidRange(range.to_string());
        let (start, end) = range.split_once('-').ok_or_else(invalid)?;
        let start: Ipv4Addr = start.trim().parse().map_err(|_| invalid())?;
        let end: Ipv4Addr = end.trim().parse().map_err(|_| invalid())?;

        let start = u32::from(start);
        let end = u32::from(end);
        if end <= start {
            return Err(invalid());
        }

        Ok(Self {
            start,
            count: end - start,
            prefix_len,
            used: Mutex::new(BTreeSet::new()),
        })
    }

    /// 为用户分配地址
    ///
    /// 起始位置由用户名的哈希决定，同一用户断线重连时倾向于拿到相同地址。
    pub fn lease_for(&self, user: &str) -> Result<Ipv4Addr, PoolError> {
        self.lease_from(self.offset_of(user))
    }

    /// 释放地址，重复释放或范围外的地址直接忽略
    pub fn release(&self, addr: Ipv4Addr) {
        let addr = u32::from(addr);
        if addr < self.start || addr - self.start >= self.count {
            return;
        }

        if let Ok(mut used) = self.used.lock() {
            used.remove(&(addr - self.start));
        }
    }

    /// 地址是否已被分配
    pub fn is_leased(&self, addr: Ipv4Addr) -> bool {
        let addr = u32::from(addr);
        if addr < self.start {
            return false;
        }

        self.used
            .lock()
            .map(|used| used.contains(&(addr - self.start)))
            .unwrap_or(false)
    }

    pub fn used_count(&self) -> usize {
        self.used.lock().map(|used| used.len()).unwrap_or(0)
    }

    pub fn capacity(&self) -> u32 {
        self.count
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn offset_of(&self, user: &str) -> u32 {
        let hash = digest::digest(&digest::SHA256, user.as_bytes());
        let mut head = [0u8; 4];
        head.copy_from_slice(&hash.as_ref()[..4]);
        u32::from_be_bytes(head) % self.count
    }

    /// 从 `idx` 开始线性探测一圈，探测和标记在同一把锁内完成
    fn lease_from(&self, idx: u32) -> Result<Ipv4Addr, PoolError> {
        let mut used = self.used.lock().map_err(|_| PoolError::PoolExhausted)?;

        for step in 0..self.count {
            let offset = ((idx as u64 + step as u64) % self.count as u64) as u32;
            if used.insert(offset) {
                return Ok(Ipv4Addr::from(self.start + offset));
            }
        }

        Err(PoolError::PoolExhausted)
    }
}
