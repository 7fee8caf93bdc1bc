//! 序列号空间
//!
//! 子流使用 32 位回绕序列号（SSN），连接级使用 64 位数据序列号（DSN）。
//! 两者都实现 [`SequenceSpace`]，缓冲区与 `TcpCore` 对二者泛型。

use std::fmt;

/// 32 位 TCP 序列号（模 2^32 比较）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SeqNum(pub u32);

impl SeqNum {
    pub fn wrapping_add(self, n: u32) -> SeqNum {
        SeqNum(self.0.wrapping_add(n))
    }

    pub fn wrapping_sub(self, n: u32) -> SeqNum {
        SeqNum(self.0.wrapping_sub(n))
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 一个可回绕/不可回绕的字节序列号空间
pub trait SequenceSpace: Copy + Eq + fmt::Debug {
    /// 前进 `n` 个字节
    fn advance(self, n: usize) -> Self;

    /// `self - base`（带符号）。32 位空间在 2^31 窗口内有效。
    fn offset_from(self, base: Self) -> i64;

    fn before(self, other: Self) -> bool {
        self.offset_from(other) < 0
    }

    fn before_or_eq(self, other: Self) -> bool {
        self.offset_from(other) <= 0
    }

    fn after(self, other: Self) -> bool {
        self.offset_from(other) > 0
    }

    fn max_seq(self, other: Self) -> Self {
        if self.before(other) { other } else { self }
    }

    /// `[self, end)` 的字节数；`end` 在 `self` 之前时为 0
    fn distance_to(self, end: Self) -> usize {
        end.offset_from(self).max(0) as usize
    }
}

impl SequenceSpace for SeqNum {
    fn advance(self, n: usize) -> Self {
        SeqNum(self.0.wrapping_add(n as u32))
    }

    fn offset_from(self, base: Self) -> i64 {
        self.0.wrapping_sub(base.0) as i32 as i64
    }
}

impl SequenceSpace for u64 {
    fn advance(self, n: usize) -> Self {
        self.wrapping_add(n as u64)
    }

    fn offset_from(self, base: Self) -> i64 {
        self.wrapping_sub(base) as i64
    }
}
