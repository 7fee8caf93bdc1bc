//! 按序列号索引的发送/接收缓冲区
//!
//! 发送缓冲区保存 `[head, tail)` 范围内尚未被确认丢弃的字节；
//! 接收缓冲区保存已按序到达但应用尚未读取的字节，以及乱序到达的片段。

use std::collections::{BTreeMap, VecDeque};

use super::seq::SequenceSpace;

/// 发送缓冲区
#[derive(Debug, Clone)]
pub struct TxBuffer<S> {
    head: S,
    data: VecDeque<u8>,
    capacity: usize,
}

impl<S: SequenceSpace> TxBuffer<S> {
    pub fn new(head: S, capacity: usize) -> Self {
        Self {
            head,
            data: VecDeque::new(),
            capacity,
        }
    }

    /// 清空缓冲区并把起始序号设为 `head`
    pub fn reset(&mut self, head: S) {
        self.head = head;
        self.data.clear();
    }

    /// 缓冲区第一个字节的序号
    pub fn head(&self) -> S {
        self.head
    }

    /// 最后一个字节之后的序号
    pub fn tail(&self) -> S {
        self.head.advance(self.data.len())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    /// 追加字节；返回实际写入的字节数（受剩余容量限制）
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free());
        self.data.extend(&bytes[..n]);
        n
    }

    /// 复制 `[from, from + max_len)` 中仍在缓冲区内的部分
    pub fn copy_range(&self, from: S, max_len: usize) -> Vec<u8> {
        let off = from.offset_from(self.head);
        if off < 0 || off as usize >= self.data.len() {
            return Vec::new();
        }
        let off = off as usize;
        let n = max_len.min(self.data.len() - off);
        self.data.range(off..off + n).copied().collect()
    }

    /// 丢弃 `seq` 之前的所有字节；返回丢弃的字节数
    pub fn discard_up_to(&mut self, seq: S) -> usize {
        let off = seq.offset_from(self.head);
        if off <= 0 {
            return 0;
        }
        let n = (off as usize).min(self.data.len());
        self.data.drain(..n);
        self.head = self.head.advance(n);
        n
    }
}

/// 接收缓冲区（含乱序重组）
#[derive(Debug, Clone)]
pub struct RxBuffer<S> {
    /// 第一个未读字节的序号
    head: S,
    /// 下一个期望的序号
    next: S,
    /// `next` 的绝对偏移（单调递增，不回绕），用作乱序表的键
    next_abs: u64,
    ready: VecDeque<u8>,
    ooo: BTreeMap<u64, Vec<u8>>,
    ooo_bytes: usize,
    capacity: usize,
}

impl<S: SequenceSpace> RxBuffer<S> {
    pub fn new(next: S, capacity: usize) -> Self {
        Self {
            head: next,
            next,
            next_abs: 0,
            ready: VecDeque::new(),
            ooo: BTreeMap::new(),
            ooo_bytes: 0,
            capacity,
        }
    }

    pub fn reset(&mut self, next: S) {
        self.head = next;
        self.next = next;
        self.next_abs = 0;
        self.ready.clear();
        self.ooo.clear();
        self.ooo_bytes = 0;
    }

    pub fn head(&self) -> S {
        self.head
    }

    pub fn next(&self) -> S {
        self.next
    }

    /// 可按序读取的字节数
    pub fn available(&self) -> usize {
        self.ready.len()
    }

    /// 已占用的字节数（按序 + 乱序）
    pub fn buffered(&self) -> usize {
        self.ready.len() + self.ooo_bytes
    }

    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.buffered())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn has_out_of_order(&self) -> bool {
        !self.ooo.is_empty()
    }

    /// 从 `seq` 起接收窗口内还能放下的字节数
    pub fn room_at(&self, seq: S) -> usize {
        let off = seq.offset_from(self.next);
        let window = self.capacity.saturating_sub(self.ready.len()) as i64;
        (window - off).max(0) as usize
    }

    /// 写入 `seq` 起的字节。返回本次使 `next` 前进的字节数。
    ///
    /// 已读/已按序的部分被裁掉；超出容量窗口的尾部被截断。
    pub fn add(&mut self, seq: S, bytes: &[u8]) -> usize {
        let off = seq.offset_from(self.next);
        let (abs, mut bytes) = if off < 0 {
            let skip = off.unsigned_abs() as usize;
            if skip >= bytes.len() {
                return 0;
            }
            (self.next_abs, &bytes[skip..])
        } else {
            (self.next_abs + off as u64, bytes)
        };

        let window_end = self.next_abs + self.capacity.saturating_sub(self.ready.len()) as u64;
        if abs >= window_end {
            return 0;
        }
        let room = (window_end - abs) as usize;
        if bytes.len() > room {
            bytes = &bytes[..room];
        }

        let before = self.next_abs;
        if abs == self.next_abs {
            self.push_in_order(bytes);
            self.merge_out_of_order();
        } else {
            match self.ooo.get(&abs) {
                Some(existing) if existing.len() >= bytes.len() => {}
                _ => {
                    if let Some(old) = self.ooo.insert(abs, bytes.to_vec()) {
                        self.ooo_bytes -= old.len();
                    }
                    self.ooo_bytes += bytes.len();
                }
            }
        }
        (self.next_abs - before) as usize
    }

    fn push_in_order(&mut self, bytes: &[u8]) {
        self.ready.extend(bytes);
        self.next_abs += bytes.len() as u64;
        self.next = self.next.advance(bytes.len());
    }

    fn merge_out_of_order(&mut self) {
        while let Some((&abs, _)) = self.ooo.first_key_value() {
            if abs > self.next_abs {
                break;
            }
            let Some(chunk) = self.ooo.remove(&abs) else {
                break;
            };
            self.ooo_bytes -= chunk.len();
            let end = abs + chunk.len() as u64;
            if end > self.next_abs {
                let skip = (self.next_abs - abs) as usize;
                self.push_in_order(&chunk[skip..]);
            }
        }
    }

    /// 读取至多 `max` 个按序字节
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.ready.len());
        let out: Vec<u8> = self.ready.drain(..n).collect();
        self.head = self.head.advance(n);
        out
    }
}
