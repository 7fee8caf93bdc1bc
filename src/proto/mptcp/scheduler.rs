//! 数据调度器
//!
//! 每次调用至多为一个子流生成一个映射：选中的子流、起始 DSN 与长度。
//! 调度器本身不修改任何连接状态，由 meta 连接负责登记映射。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sim::SimTime;

use super::SubflowId;

/// 调度器看到的一个已建立子流
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubflowStatus {
    pub id: SubflowId,
    /// 当前 RTT 估计（无样本时为 RTO）
    pub rtt: SimTime,
    /// 前向单向时延估计
    pub owd: Option<SimTime>,
    /// 子流可用窗口（字节）
    pub available_window: u64,
}

/// 一次调度的输入
#[derive(Debug, Clone, Copy)]
pub struct SchedulerInput<'a> {
    /// 发送缓冲区中尚未映射的字节数
    pub unmapped: u64,
    /// 连接级可用窗口（对端 data-level 接收窗口余量）
    pub conn_window: u64,
    /// 单个映射的最大长度
    pub segment_size: u32,
    /// 第一个未映射字节的 DSN
    pub next_dsn: u64,
    pub subflows: &'a [SubflowStatus],
}

/// 调度结果：把 `[dsn, dsn + length)` 交给 `subflow`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledChunk {
    pub subflow: SubflowId,
    pub dsn: u64,
    pub length: u16,
}

pub trait Scheduler: Send + fmt::Debug {
    /// 选择子流并给出映射；无数据、无连接级窗口或无可用子流时返回 `None`
    fn generate_mapping(&mut self, input: &SchedulerInput<'_>) -> Option<ScheduledChunk>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    RoundRobin,
    #[default]
    FastestRtt,
    OwdAware,
}

pub fn create_scheduler(kind: SchedulerKind) -> Box<dyn Scheduler> {
    match kind {
        SchedulerKind::RoundRobin => Box::new(RoundRobinScheduler::default()),
        SchedulerKind::FastestRtt => Box::new(FastestRttScheduler),
        SchedulerKind::OwdAware => Box::new(OwdAwareScheduler),
    }
}

/// 公共前置检查与映射长度计算
fn chunk_for(input: &SchedulerInput<'_>, sf: &SubflowStatus) -> Option<ScheduledChunk> {
    let len = input
        .unmapped
        .min(input.conn_window)
        .min(sf.available_window)
        .min(input.segment_size as u64)
        .min(u16::MAX as u64);
    (len > 0).then_some(ScheduledChunk {
        subflow: sf.id,
        dsn: input.next_dsn,
        length: len as u16,
    })
}

fn has_work(input: &SchedulerInput<'_>) -> bool {
    input.unmapped > 0 && input.conn_window > 0 && !input.subflows.is_empty()
}

/// 轮询：从上次选中位置之后开始找第一个有窗口的子流
#[derive(Debug, Default)]
pub struct RoundRobinScheduler {
    next: usize,
}

impl Scheduler for RoundRobinScheduler {
    fn generate_mapping(&mut self, input: &SchedulerInput<'_>) -> Option<ScheduledChunk> {
        if !has_work(input) {
            return None;
        }
        let n = input.subflows.len();
        for step in 0..n {
            let idx = (self.next + step) % n;
            let sf = &input.subflows[idx];
            if sf.available_window == 0 {
                continue;
            }
            if let Some(chunk) = chunk_for(input, sf) {
                self.next = (idx + 1) % n;
                return Some(chunk);
            }
        }
        None
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// 选 RTT 最小且有窗口的子流；并列时取迭代顺序中第一个
#[derive(Debug, Default)]
pub struct FastestRttScheduler;

impl Scheduler for FastestRttScheduler {
    fn generate_mapping(&mut self, input: &SchedulerInput<'_>) -> Option<ScheduledChunk> {
        if !has_work(input) {
            return None;
        }
        let best = input
            .subflows
            .iter()
            .filter(|sf| sf.available_window > 0)
            .fold(None::<&SubflowStatus>, |best, sf| match best {
                Some(b) if b.rtt <= sf.rtt => Some(b),
                _ => Some(sf),
            })?;
        chunk_for(input, best)
    }

    fn name(&self) -> &'static str {
        "fastest_rtt"
    }
}

/// 选前向单向时延最小的子流；没有 OWD 探测结果的子流按 RTT/2 估计
#[derive(Debug, Default)]
pub struct OwdAwareScheduler;

impl Scheduler for OwdAwareScheduler {
    fn generate_mapping(&mut self, input: &SchedulerInput<'_>) -> Option<ScheduledChunk> {
        if !has_work(input) {
            return None;
        }
        let owd = |sf: &SubflowStatus| sf.owd.unwrap_or(SimTime(sf.rtt.0 / 2));
        let best = input
            .subflows
            .iter()
            .filter(|sf| sf.available_window > 0)
            .fold(None::<&SubflowStatus>, |best, sf| match best {
                Some(b) if owd(b) <= owd(sf) => Some(b),
                _ => Some(sf),
            })?;
        chunk_for(input, best)
    }

    fn name(&self) -> &'static str {
        "owd_aware"
    }
}
