//! TCP 段头部与段
//!
//! 只建模协议逻辑需要的字段；选项以 (kind, 字节) 的形式携带，
//! MPTCP 选项使用 RFC 6824 的线上编码。

use std::fmt;
use std::net::SocketAddrV4;

use super::seq::SeqNum;

/// TCP 时间戳选项（RFC 7323）
pub const OPT_TIMESTAMP: u8 = 8;
/// MPTCP 选项（RFC 6824）
pub const OPT_MPTCP: u8 = 30;

/// TCP 固定头部字节数（IP 头由网络层另计）
pub const BASE_HEADER_BYTES: usize = 20;

/// TCP 标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);

    pub const fn empty() -> TcpFlags {
        TcpFlags(0)
    }

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn syn(self) -> bool {
        self.contains(TcpFlags::SYN)
    }

    pub fn ack(self) -> bool {
        self.contains(TcpFlags::ACK)
    }

    pub fn fin(self) -> bool {
        self.contains(TcpFlags::FIN)
    }

    pub fn rst(self) -> bool {
        self.contains(TcpFlags::RST)
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (TcpFlags::SYN, "S"),
            (TcpFlags::FIN, "F"),
            (TcpFlags::RST, "R"),
            (TcpFlags::PSH, "P"),
            (TcpFlags::ACK, "."),
        ];
        for (flag, name) in names {
            if self.contains(flag) {
                f.write_str(name)?;
            }
        }
        Ok(())
    }
}

/// 一个 TCP 选项（不含 kind/length 两个字节）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpOption {
    pub kind: u8,
    pub data: Vec<u8>,
}

/// TCP 头部
#[derive(Debug, Clone)]
pub struct TcpHeader {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub flags: TcpFlags,
    pub seq: SeqNum,
    pub ack: SeqNum,
    /// 通告窗口（字节；仿真中不做窗口缩放）
    pub window: u32,
    options: Vec<TcpOption>,
}

impl TcpHeader {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4, flags: TcpFlags, seq: SeqNum, ack: SeqNum, window: u32) -> Self {
        Self {
            src,
            dst,
            flags,
            seq,
            ack,
            window,
            options: Vec::new(),
        }
    }

    /// 追加一个选项（同类可重复）
    pub fn add_option(&mut self, kind: u8, data: Vec<u8>) {
        self.options.push(TcpOption { kind, data });
    }

    /// 设置选项：替换第一个同类选项，否则追加
    pub fn set_option(&mut self, kind: u8, data: Vec<u8>) {
        match self.options.iter_mut().find(|o| o.kind == kind) {
            Some(opt) => opt.data = data,
            None => self.add_option(kind, data),
        }
    }

    /// 第一个 `kind` 类选项
    pub fn get_option(&self, kind: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|o| o.kind == kind)
            .map(|o| o.data.as_slice())
    }

    /// 所有 `kind` 类选项
    pub fn options(&self, kind: u8) -> impl Iterator<Item = &[u8]> + '_ {
        self.options
            .iter()
            .filter(move |o| o.kind == kind)
            .map(|o| o.data.as_slice())
    }

    pub fn set_timestamp(&mut self, val: u32, ecr: u32) {
        let mut data = Vec::with_capacity(8);
        data.extend_from_slice(&val.to_be_bytes());
        data.extend_from_slice(&ecr.to_be_bytes());
        self.set_option(OPT_TIMESTAMP, data);
    }

    /// (TSval, TSecr)
    pub fn timestamp(&self) -> Option<(u32, u32)> {
        let data = self.get_option(OPT_TIMESTAMP)?;
        if data.len() != 8 {
            return None;
        }
        let val = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let ecr = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        Some((val, ecr))
    }

    /// 选项区长度（按 4 字节对齐）
    pub fn options_len(&self) -> usize {
        let raw: usize = self.options.iter().map(|o| o.data.len() + 2).sum();
        raw.div_ceil(4) * 4
    }

    /// TCP 头部总字节数（含选项填充）
    pub fn wire_len(&self) -> usize {
        BASE_HEADER_BYTES + self.options_len()
    }
}

/// 一个 TCP 段：头部 + 载荷
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub header: TcpHeader,
    pub payload: Vec<u8>,
}

impl TcpSegment {
    pub fn new(header: TcpHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// 占用的序列号空间（载荷 + SYN + FIN）
    pub fn seq_len(&self) -> usize {
        self.payload.len()
            + usize::from(self.header.flags.syn())
            + usize::from(self.header.flags.fin())
    }

    /// 线上字节数
    pub fn wire_len(&self) -> usize {
        self.header.wire_len() + self.payload.len()
    }
}
