//! TCP 状态机
//!
//! 子流和 meta 连接共用同一套状态及迁移规则：
//! 子流以 FIN 驱动，meta 连接以 DATA_FIN 驱动。

use serde::{Deserialize, Serialize};
use std::fmt;

/// RFC 793 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// 三次握手已完成（含各关闭中状态）
    pub fn is_synchronized(self) -> bool {
        !matches!(
            self,
            TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynRcvd
        )
    }

    /// 本端仍可发送新数据
    pub fn can_send(self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }

    /// 对端仍可能发送新数据
    pub fn can_receive(self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        )
    }

    /// 已进入关闭流程（FIN 已发出或已收到）
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::CloseWait
                | TcpState::Closing
                | TcpState::LastAck
                | TcpState::TimeWait
        )
    }

    /// 本端发起关闭（发送 FIN）
    pub fn on_close(self) -> Option<TcpState> {
        match self {
            TcpState::SynRcvd | TcpState::Established => Some(TcpState::FinWait1),
            TcpState::CloseWait => Some(TcpState::LastAck),
            _ => None,
        }
    }

    /// 收到对端 FIN
    pub fn on_fin_received(self) -> Option<TcpState> {
        match self {
            TcpState::Established => Some(TcpState::CloseWait),
            TcpState::FinWait1 => Some(TcpState::Closing),
            TcpState::FinWait2 => Some(TcpState::TimeWait),
            _ => None,
        }
    }

    /// 本端 FIN 被确认
    pub fn on_fin_acked(self) -> Option<TcpState> {
        match self {
            TcpState::FinWait1 => Some(TcpState::FinWait2),
            TcpState::Closing => Some(TcpState::TimeWait),
            TcpState::LastAck => Some(TcpState::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRcvd => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(s)
    }
}
