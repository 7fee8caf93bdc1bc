//! MPTCP 错误类型

use std::net::SocketAddrV4;

use thiserror::Error;

use crate::proto::tcp::TcpState;

/// 错误的大类，决定调用方如何处置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 收发两端状态已不同步（映射缺失/重叠等），必须中止连接
    ProtocolInvariantViolation,
    /// 对端发来非法或不可接受的 MPTCP 信令，以 RST 关闭
    PeerProtocol,
    /// 本地调用方式错误（状态不对、地址冲突等）
    Usage,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MptcpError {
    #[error("protocol invariant violated: {0}")]
    ProtocolInvariantViolation(String),
    #[error("malformed MPTCP option: {0}")]
    MalformedOption(&'static str),
    #[error("MP_JOIN authentication failed")]
    AuthenticationFailed,
    #[error("unknown MP_JOIN token {0:#010x}")]
    UnknownToken(u32),
    #[error("connection is not fully established")]
    NotFullyEstablished,
    #[error("operation not valid in state {0}")]
    InvalidState(TcpState),
    #[error("address {0} already in use")]
    AddressInUse(SocketAddrV4),
    #[error("socket is not bound to a local address")]
    NotBound,
    #[error("unknown connection {0}")]
    UnknownConnection(u64),
    #[error("unknown subflow {0}")]
    UnknownSubflow(usize),
    #[error("unknown address id {0}")]
    UnknownAddressId(u8),
    #[error("address id space exhausted")]
    AddressIdExhausted,
}

impl MptcpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MptcpError::ProtocolInvariantViolation(_) => ErrorKind::ProtocolInvariantViolation,
            MptcpError::MalformedOption(_)
            | MptcpError::AuthenticationFailed
            | MptcpError::UnknownToken(_) => ErrorKind::PeerProtocol,
            _ => ErrorKind::Usage,
        }
    }
}

pub type Result<T> = std::result::Result<T, MptcpError>;

/// 构造一个不变量违反错误。
///
/// debug 构建直接 panic；release 构建返回 `ProtocolInvariantViolation`，由协议栈中止连接。
#[track_caller]
pub(crate) fn invariant_violation(what: impl Into<String>) -> MptcpError {
    let what = what.into();
    if cfg!(debug_assertions) {
        panic!("protocol invariant violated: {what}");
    }
    tracing::error!(%what, "protocol invariant violated");
    MptcpError::ProtocolInvariantViolation(what)
}
