//! 链路出口队列
//!
//! 每条单向链路一个队列；当前只有 DropTail。

use crate::net::Packet;

mod drop_tail;

pub use drop_tail::DropTailQueue;

/// 以“包”为单位配置队列时假定的包长
pub const DEFAULT_PKT_BYTES: u64 = 1500;

pub fn mem_from_pkt(pkts: u64) -> u64 {
    pkts.saturating_mul(DEFAULT_PKT_BYTES)
}

pub trait PacketQueue: std::fmt::Debug {
    /// 入队；放不下时原样退回 `Err(pkt)`
    fn enqueue(&mut self, pkt: Packet) -> Result<(), Packet>;
    fn dequeue(&mut self) -> Option<Packet>;

    fn len(&self) -> usize;
    fn bytes(&self) -> u64;
    fn capacity_bytes(&self) -> u64;
    /// 运行以来的最大排队字节数
    fn peak_bytes(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
