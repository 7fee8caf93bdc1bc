use serde::{Deserialize, Serialize};

use crate::sim::SimTime;

/// 子流级 TCP 参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// MSS（数据段载荷大小，字节）
    pub mss: u32,
    /// 初始 cwnd（MSS 个数）
    pub init_cwnd_segments: u32,
    /// 初始 ssthresh（字节）
    pub init_ssthresh_bytes: u64,
    /// 初始 RTO
    pub init_rto: SimTime,
    /// 最小 RTO
    pub min_rto: SimTime,
    /// 最大 RTO（用于退避上限）
    pub max_rto: SimTime,
    /// SYN 最大重传次数，超过即连接失败
    pub syn_retries: u32,
    /// 数据段连续超时次数上限，超过即复位子流
    pub data_retries: u32,
    /// 每收到多少个满载荷段立即 ACK
    pub delayed_ack_count: u32,
    /// 延迟 ACK 超时
    pub delayed_ack_timeout: SimTime,
    /// TIME_WAIT 持续时间（2MSL）
    pub time_wait: SimTime,
    /// 零窗口探测间隔
    pub persist_timeout: SimTime,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mss: 1400,
            init_cwnd_segments: 10,
            init_ssthresh_bytes: 1400 * 1_000,
            init_rto: SimTime::from_millis(200),
            min_rto: SimTime::from_millis(10),
            max_rto: SimTime::from_secs(60),
            syn_retries: 6,
            data_retries: 15,
            delayed_ack_count: 2,
            delayed_ack_timeout: SimTime::from_millis(20),
            time_wait: SimTime::from_millis(20),
            persist_timeout: SimTime::from_millis(200),
        }
    }
}

impl TcpConfig {
    pub fn init_cwnd_bytes(&self) -> u64 {
        (self.mss as u64).saturating_mul(self.init_cwnd_segments.max(1) as u64)
    }
}
