//! 面向应用的套接字接口
//!
//! 应用实现 [`Application`]，协议栈在连接状态变化时回调它；
//! 回调中拿到的 [`Socket`] 句柄可以继续收发、关闭或建立新子流。

use std::net::SocketAddrV4;

use crate::net::NetApi;
use crate::proto::tcp::TcpState;
use crate::sim::{SimTime, Simulator};

use super::error::Result;
use super::stack::MptcpStack;
use super::{ConnId, SubflowId};

/// 应用在协议栈中的编号
pub type AppId = usize;

/// 协议栈排队、稍后派发给应用的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AppEvent {
    Connected,
    ConnectFailed,
    Accepted { listener: ConnId },
    DataAvailable,
    SendPossible(usize),
    SubflowCreated(SubflowId),
    SubflowConnected(SubflowId),
    FullyEstablished,
    PeerClosed,
    Closed,
    Reset,
}

/// 应用回调。默认实现都是空操作。
pub trait Application: Send {
    fn on_connected(&mut self, _sock: &mut Socket<'_>) {}

    fn on_connect_failed(&mut self, _sock: &mut Socket<'_>) {}

    /// 监听套接字 `listener` 上完成了一次被动打开
    fn on_accept(&mut self, _listener: ConnId, _sock: &mut Socket<'_>) {}

    fn on_data_available(&mut self, _sock: &mut Socket<'_>) {}

    /// 发送缓冲区腾出了空间
    fn on_send_possible(&mut self, _sock: &mut Socket<'_>, _space: usize) {}

    fn on_subflow_created(&mut self, _sock: &mut Socket<'_>, _subflow: SubflowId) {}

    fn on_subflow_connected(&mut self, _sock: &mut Socket<'_>, _subflow: SubflowId) {}

    /// 收到第一个 DSS，可以建立额外子流
    fn on_fully_established(&mut self, _sock: &mut Socket<'_>) {}

    /// 对端发送了 DATA_FIN
    fn on_peer_close(&mut self, _sock: &mut Socket<'_>) {}

    fn on_closed(&mut self, _sock: &mut Socket<'_>) {}

    fn on_reset(&mut self, _sock: &mut Socket<'_>) {}
}

/// 回调期间的连接句柄
pub struct Socket<'a> {
    pub(crate) stack: &'a mut MptcpStack,
    pub(crate) sim: &'a mut Simulator,
    pub(crate) net: &'a mut dyn NetApi,
    pub(crate) conn: ConnId,
}

impl Socket<'_> {
    pub fn id(&self) -> ConnId {
        self.conn
    }

    pub fn now(&self) -> SimTime {
        self.sim.now()
    }

    /// 写入发送缓冲区，返回实际写入的字节数（缓冲区满时为 0）
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.stack.send_inner(self.conn, data, self.sim, self.net)
    }

    /// 读取至多 `max` 个按序字节
    pub fn recv(&mut self, max: usize) -> Result<Vec<u8>> {
        self.stack.recv_inner(self.conn, max, self.sim, self.net)
    }

    /// 可读字节数
    pub fn available(&self) -> usize {
        self.stack.meta(self.conn).map_or(0, |m| m.rx_available())
    }

    /// 发送缓冲区剩余空间
    pub fn send_space(&self) -> usize {
        self.stack.meta(self.conn).map_or(0, |m| m.tx_free())
    }

    pub fn close(&mut self) -> Result<()> {
        self.stack.close_inner(self.conn, self.sim, self.net)
    }

    pub fn connect_new_subflow(&mut self, local: SocketAddrV4, remote: SocketAddrV4) -> Result<SubflowId> {
        self.stack
            .connect_new_subflow_inner(self.conn, local, remote, self.sim, self.net)
    }

    pub fn advertise_address(&mut self, addr: SocketAddrV4) -> Result<u8> {
        self.stack
            .advertise_address_inner(self.conn, addr, self.sim, self.net)
    }

    pub fn withdraw_address(&mut self, id: u8) -> Result<()> {
        self.stack
            .withdraw_address_inner(self.conn, id, self.sim, self.net)
    }

    pub fn state(&self) -> TcpState {
        self.stack
            .meta(self.conn)
            .map_or(TcpState::Closed, |m| m.state())
    }

    pub fn is_fully_established(&self) -> bool {
        self.stack
            .meta(self.conn)
            .is_some_and(|m| m.is_fully_established())
    }

    pub fn subflow_count(&self) -> usize {
        self.stack.meta(self.conn).map_or(0, |m| m.subflow_count())
    }

    /// 对端已知的地址（含 ADD_ADDR 通告的）
    pub fn remote_addresses(&self) -> Vec<(u8, SocketAddrV4)> {
        self.stack
            .meta(self.conn)
            .map(|m| m.remote_ids().iter().collect())
            .unwrap_or_default()
    }
}
