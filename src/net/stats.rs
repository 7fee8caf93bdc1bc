//! 统计信息
//!
//! 定义网络仿真统计数据结构。

/// 网络统计信息
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub delivered_pkts: u64,
    pub delivered_bytes: u64,
    /// 队列溢出或链路中断造成的丢包
    pub dropped_pkts: u64,
    pub dropped_bytes: u64,
    /// 找不到路由而直接丢弃的段
    pub unroutable: u64,
}
