//! DSN ↔ SSN 映射
//!
//! 每个子流有两个 [`MappingContainer`]：发送方向和接收方向。
//! 容器内映射按 SSN 排序且互不重叠。

use std::collections::VecDeque;
use std::fmt;

use crate::proto::tcp::{SeqNum, SequenceSpace};

/// 一段连接级数据（DSN）到子流序号（SSN）的绑定。创建后不可变。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mapping {
    head_dsn: u64,
    head_ssn: SeqNum,
    length: u16,
    data_fin: bool,
}

impl Mapping {
    pub fn new(head_dsn: u64, head_ssn: SeqNum, length: u16) -> Self {
        Self {
            head_dsn,
            head_ssn,
            length,
            data_fin: false,
        }
    }

    /// 仅携带 DATA_FIN 的映射：长度为 0，不占子流序号
    pub fn data_fin_only(dsn: u64) -> Self {
        Self {
            head_dsn: dsn,
            head_ssn: SeqNum(0),
            length: 0,
            data_fin: true,
        }
    }

    pub fn head_dsn(&self) -> u64 {
        self.head_dsn
    }

    /// 最后一个字节的 DSN（长度为 0 时等于 head）
    pub fn tail_dsn(&self) -> u64 {
        self.head_dsn.advance(self.length.max(1) as usize - 1)
    }

    pub fn head_ssn(&self) -> SeqNum {
        self.head_ssn
    }

    /// 最后一个字节的 SSN
    pub fn tail_ssn(&self) -> SeqNum {
        self.head_ssn.advance(self.length.max(1) as usize - 1)
    }

    pub fn len(&self) -> u16 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_data_fin(&self) -> bool {
        self.data_fin
    }

    pub fn covers_ssn(&self, ssn: SeqNum) -> bool {
        if self.length == 0 {
            return false;
        }
        let off = ssn.offset_from(self.head_ssn);
        off >= 0 && off < self.length as i64
    }

    pub fn covers_dsn(&self, dsn: u64) -> bool {
        self.head_dsn.before_or_eq(dsn) && dsn.before(self.head_dsn.advance(self.length as usize))
    }

    /// 两个映射的 SSN 区间是否相交
    pub fn overlaps_ssn(&self, other: &Mapping) -> bool {
        if self.length == 0 || other.length == 0 {
            return false;
        }
        self.covers_ssn(other.head_ssn) || other.covers_ssn(self.head_ssn)
    }

    /// `ssn` 对应的 DSN（`ssn` 必须被覆盖）
    pub fn dsn_for_ssn(&self, ssn: SeqNum) -> Option<u64> {
        self.covers_ssn(ssn)
            .then(|| self.head_dsn.advance(ssn.offset_from(self.head_ssn) as usize))
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DSN [{}..{}] <-> SSN [{}..{}]",
            self.head_dsn,
            self.tail_dsn(),
            self.head_ssn,
            self.tail_ssn()
        )?;
        if self.data_fin {
            f.write_str(" +DFIN")?;
        }
        Ok(())
    }
}

/// 一个子流的一组映射（按 SSN 升序）
#[derive(Debug, Clone, Default)]
pub struct MappingContainer {
    mappings: VecDeque<Mapping>,
}

impl MappingContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> + '_ {
        self.mappings.iter()
    }

    /// SSN 最小的映射
    pub fn oldest(&self) -> Option<Mapping> {
        self.mappings.front().copied()
    }

    pub fn contains(&self, m: &Mapping) -> bool {
        self.mappings.iter().any(|x| x == m)
    }

    /// 插入映射；与已有映射的 SSN 区间相交或长度为 0 时返回 false。
    pub fn add_mapping(&mut self, m: Mapping) -> bool {
        if m.is_empty() {
            return false;
        }
        let idx = self
            .mappings
            .iter()
            .position(|x| m.head_ssn.before(x.head_ssn))
            .unwrap_or(self.mappings.len());
        if idx > 0 && self.mappings[idx - 1].overlaps_ssn(&m) {
            return false;
        }
        if idx < self.mappings.len() && self.mappings[idx].overlaps_ssn(&m) {
            return false;
        }
        self.mappings.insert(idx, m);
        true
    }

    /// 覆盖 `ssn` 的映射
    pub fn get_mapping_for_ssn(&self, ssn: SeqNum) -> Option<Mapping> {
        self.mappings.iter().find(|m| m.covers_ssn(ssn)).copied()
    }

    /// 最高映射尾部之后的 SSN；没有映射时返回 `buffer_tail`
    pub fn first_unmapped_ssn(&self, buffer_tail: SeqNum) -> SeqNum {
        match self.mappings.back() {
            Some(m) => m.tail_ssn().advance(1),
            None => buffer_tail,
        }
    }

    /// 移除映射；不存在时返回 false
    pub fn discard_mapping(&mut self, m: &Mapping) -> bool {
        match self.mappings.iter().position(|x| x == m) {
            Some(idx) => {
                self.mappings.remove(idx);
                true
            }
            None => false,
        }
    }

    /// 头部 SSN 不早于 `ssn` 的所有映射
    pub fn mappings_starting_from_ssn(&self, ssn: SeqNum) -> Vec<Mapping> {
        self.mappings
            .iter()
            .filter(|m| !m.head_ssn.before(ssn))
            .copied()
            .collect()
    }

    /// 移除所有满足条件的映射，返回被移除的映射
    pub fn discard_where(&mut self, mut pred: impl FnMut(&Mapping) -> bool) -> Vec<Mapping> {
        let mut removed = Vec::new();
        self.mappings.retain(|m| {
            if pred(m) {
                removed.push(*m);
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn clear(&mut self) -> Vec<Mapping> {
        self.mappings.drain(..).collect()
    }
}
