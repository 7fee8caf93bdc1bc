//! 子流与 meta 连接共享的传输状态

use super::buffer::{RxBuffer, TxBuffer};
use super::seq::SequenceSpace;
use super::state::TcpState;

/// 一个序列号空间上的发送/接收状态。
///
/// `Subflow` 以 `TcpCore<SeqNum>` 按值持有，`MetaConnection` 以 `TcpCore<u64>` 按值持有。
#[derive(Debug, Clone)]
pub struct TcpCore<S> {
    pub state: TcpState,
    /// 下一个待发送的序号
    pub next_tx: S,
    /// 最早未确认的序号
    pub first_unacked: S,
    /// 曾发送过的最高序号之后一位
    pub high_tx_mark: S,
    pub tx: TxBuffer<S>,
    pub rx: RxBuffer<S>,
}

impl<S: SequenceSpace> TcpCore<S> {
    /// `initial_tx` 为第一个待发送序号，`tx_data_start` 为第一个数据字节的序号
    pub fn new(initial_tx: S, tx_data_start: S, rx_next: S, tx_capacity: usize, rx_capacity: usize) -> Self {
        Self {
            state: TcpState::Closed,
            next_tx: initial_tx,
            first_unacked: initial_tx,
            high_tx_mark: initial_tx,
            tx: TxBuffer::new(tx_data_start, tx_capacity),
            rx: RxBuffer::new(rx_next, rx_capacity),
        }
    }

    /// 切换状态，返回旧状态
    pub fn set_state(&mut self, new: TcpState) -> TcpState {
        std::mem::replace(&mut self.state, new)
    }

    /// 已发送未确认的序号数
    pub fn in_flight(&self) -> usize {
        self.first_unacked.distance_to(self.next_tx)
    }

    /// 已在发送缓冲区但尚未发送的字节数
    pub fn unsent(&self) -> usize {
        self.next_tx.max_seq(self.tx.head()).distance_to(self.tx.tail())
    }

    /// 记录已发送到 `upto`（不含）
    pub fn record_sent(&mut self, upto: S) {
        self.next_tx = upto;
        self.high_tx_mark = self.high_tx_mark.max_seq(upto);
    }

    /// 累计确认推进到 `ack`；返回新确认的序号数（不含越界部分）
    pub fn ack_up_to(&mut self, ack: S) -> usize {
        if !self.first_unacked.before(ack) || self.high_tx_mark.before(ack) {
            return 0;
        }
        let newly = self.first_unacked.distance_to(ack);
        self.first_unacked = ack;
        if self.next_tx.before(ack) {
            self.next_tx = ack;
        }
        self.tx.discard_up_to(ack);
        newly
    }
}
