use serde::{Deserialize, Serialize};

use crate::proto::tcp::TcpConfig;

use super::lia::CongestionControlKind;
use super::scheduler::SchedulerKind;

/// MPTCP 连接参数（每个协议栈一份）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MptcpConfig {
    /// 子流 TCP 参数
    pub tcp: TcpConfig,
    pub scheduler: SchedulerKind,
    pub congestion_control: CongestionControlKind,
    /// LIA 的精度常数
    pub alpha_scale: f64,
    /// 连接级发送缓冲区（字节）
    pub tx_buffer_bytes: usize,
    /// 连接级接收缓冲区（字节），同时是通告窗口的上限
    pub rx_buffer_bytes: usize,
    /// 密钥/随机数生成器种子
    pub key_seed: u64,
}

impl Default for MptcpConfig {
    fn default() -> Self {
        Self {
            tcp: TcpConfig::default(),
            scheduler: SchedulerKind::default(),
            congestion_control: CongestionControlKind::default(),
            alpha_scale: 1.0,
            tx_buffer_bytes: 256 * 1024,
            rx_buffer_bytes: 256 * 1024,
            key_seed: 0x4D50_5443_5053_494D,
        }
    }
}
