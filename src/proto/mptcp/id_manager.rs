//! 地址标识管理
//!
//! 每个 meta 连接各有一个本地、一个远端 [`AddressIdManager`]，
//! 在 1 字节地址 id 与套接字地址之间维持双向单射。

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddrV4;

#[derive(Debug, Clone, Default)]
pub struct AddressIdManager {
    by_id: BTreeMap<u8, SocketAddrV4>,
    by_addr: HashMap<SocketAddrV4, u8>,
}

impl AddressIdManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记 `id -> addr`。id 已存在（即使地址相同）或地址已对应另一个 id 时返回 false，表不变
    pub fn add_id(&mut self, id: u8, addr: SocketAddrV4) -> bool {
        if self.by_id.contains_key(&id) || self.by_addr.contains_key(&addr) {
            return false;
        }
        self.by_id.insert(id, addr);
        self.by_addr.insert(addr, id);
        true
    }

    /// `id` 是否恰好登记为 `addr`
    pub fn contains(&self, id: u8, addr: SocketAddrV4) -> bool {
        self.by_id.get(&id) == Some(&addr)
    }

    /// 为 `addr` 分配最小的空闲 id；已登记则返回原 id
    pub fn allocate(&mut self, addr: SocketAddrV4) -> Option<u8> {
        if let Some(&id) = self.by_addr.get(&addr) {
            return Some(id);
        }
        let id = (0..=u8::MAX).find(|id| !self.by_id.contains_key(id))?;
        self.add_id(id, addr).then_some(id)
    }

    pub fn get_address(&self, id: u8) -> Option<SocketAddrV4> {
        self.by_id.get(&id).copied()
    }

    pub fn get_id(&self, addr: &SocketAddrV4) -> Option<u8> {
        self.by_addr.get(addr).copied()
    }

    /// REMOVE_ADDR：释放 id，之后可重新登记
    pub fn remove_id(&mut self, id: u8) -> Option<SocketAddrV4> {
        let addr = self.by_id.remove(&id)?;
        self.by_addr.remove(&addr);
        Some(addr)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, SocketAddrV4)> + '_ {
        self.by_id.iter().map(|(id, addr)| (*id, *addr))
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_addr.clear();
    }
}
