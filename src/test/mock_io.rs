//! 不经过网络的 `Io`：记录发出的段、定时器与可视化事件

use crate::proto::mptcp::{Io, TimerKey, TimerKind};
use crate::proto::tcp::TcpSegment;
use crate::sim::{EventId, SimTime};
use crate::viz::VizEventKind;

#[derive(Debug, Default)]
pub(super) struct MockIo {
    pub now: SimTime,
    pub sent: Vec<TcpSegment>,
    pub timers: Vec<(EventId, SimTime, TimerKey)>,
    pub cancelled: Vec<EventId>,
    pub viz: Vec<VizEventKind>,
    next_id: u64,
}

impl MockIo {
    /// 取出目前为止发出的所有段
    pub fn take_sent(&mut self) -> Vec<TcpSegment> {
        std::mem::take(&mut self.sent)
    }

    /// 恰好发出了一个段
    pub fn take_one(&mut self) -> TcpSegment {
        let mut sent = self.take_sent();
        assert_eq!(sent.len(), 1, "expected exactly one segment, got {sent:?}");
        sent.remove(0)
    }

    /// 仍处于活动状态的定时器
    pub fn live_timers(&self) -> Vec<TimerKey> {
        self.timers
            .iter()
            .filter(|(id, _, _)| !self.cancelled.contains(id))
            .map(|(_, _, key)| *key)
            .collect()
    }

    /// 把所有活动的 `kind` 定时器视为到期：标记为已消费并返回
    pub fn expire(&mut self, kind: TimerKind) -> Vec<TimerKey> {
        let due: Vec<_> = self
            .timers
            .iter()
            .filter(|(id, _, key)| key.kind == kind && !self.cancelled.contains(id))
            .map(|(id, _, key)| (*id, *key))
            .collect();
        self.cancelled.extend(due.iter().map(|(id, _)| *id));
        due.into_iter().map(|(_, key)| key).collect()
    }
}

impl Io for MockIo {
    fn now(&self) -> SimTime {
        self.now
    }

    fn send(&mut self, _flow_id: u64, seg: TcpSegment) {
        self.sent.push(seg);
    }

    fn schedule(&mut self, after: SimTime, key: TimerKey) -> EventId {
        self.next_id += 1;
        let id = EventId(self.next_id);
        self.timers.push((id, self.now.saturating_add(after), key));
        id
    }

    fn cancel(&mut self, id: EventId) {
        self.cancelled.push(id);
    }

    fn viz(&mut self, _flow_id: u64, kind: VizEventKind) {
        self.viz.push(kind);
    }
}
