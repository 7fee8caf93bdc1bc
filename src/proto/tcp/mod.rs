//! TCP 基础设施
//!
//! 序列号空间、发送/接收缓冲区、状态机、RTT 估计与段格式。
//! MPTCP 的子流与 meta 连接都建立在这里的 `TcpCore` 之上。

mod buffer;
mod config;
mod tcb;
mod header;
mod rtt;
mod seq;
mod state;

pub use buffer::{RxBuffer, TxBuffer};
pub use config::TcpConfig;
pub use tcb::TcpCore;
pub use header::{BASE_HEADER_BYTES, OPT_MPTCP, OPT_TIMESTAMP, TcpFlags, TcpHeader, TcpOption, TcpSegment};
pub use rtt::RttEstimator;
pub use seq::{SeqNum, SequenceSpace};
pub use state::TcpState;
