//! 协议代码与仿真环境之间的接口
//!
//! 子流与 meta 连接只通过 [`Io`] 访问时钟、发送段、调度/取消定时器，
//! 因此可以脱离 `Network` 单独测试。

use tracing::trace;

use crate::net::{NetApi, NetWorld};
use crate::proto::tcp::TcpSegment;
use crate::sim::{Event, EventId, SimTime, Simulator, World};
use crate::viz::VizEventKind;

use super::{ConnId, SubflowId};

/// 定时器种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// 子流 RTO（握手、数据、MP_JOIN 第三个 ACK）
    Retransmit,
    DelayedAck,
    /// 子流或 meta 的 TIME_WAIT
    TimeWait,
    /// meta 级零窗口探测
    Persist,
    /// DATA_FIN 重传
    DataFinRetransmit,
}

/// 定时器归属：哪个连接、哪个子流（`None` 表示 meta 自身）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub conn: ConnId,
    pub subflow: Option<SubflowId>,
    pub kind: TimerKind,
}

pub trait Io {
    fn now(&self) -> SimTime;

    /// 发送一个段；`flow_id` 为发送方连接 id
    fn send(&mut self, flow_id: u64, seg: TcpSegment);

    /// `after` 之后触发 `key`
    fn schedule(&mut self, after: SimTime, key: TimerKey) -> EventId;

    fn cancel(&mut self, id: EventId);

    fn viz(&mut self, _flow_id: u64, _kind: VizEventKind) {}
}

/// 基于 `Simulator` + `NetApi` 的 `Io`
pub struct SimIo<'a> {
    pub sim: &'a mut Simulator,
    pub net: &'a mut dyn NetApi,
}

impl<'a> SimIo<'a> {
    pub fn new(sim: &'a mut Simulator, net: &'a mut dyn NetApi) -> Self {
        Self { sim, net }
    }
}

impl Io for SimIo<'_> {
    fn now(&self) -> SimTime {
        self.sim.now()
    }

    fn send(&mut self, flow_id: u64, seg: TcpSegment) {
        self.net.send_segment(flow_id, seg, self.sim);
    }

    fn schedule(&mut self, after: SimTime, key: TimerKey) -> EventId {
        self.sim.schedule_after(after, MptcpTimer { key })
    }

    fn cancel(&mut self, id: EventId) {
        self.sim.cancel(id);
    }

    fn viz(&mut self, flow_id: u64, kind: VizEventKind) {
        let now = self.sim.now();
        self.net.viz_mptcp(now, flow_id, kind);
    }
}

/// 事件：MPTCP 定时器到期
#[derive(Debug)]
pub struct MptcpTimer {
    pub key: TimerKey,
}

impl Event for MptcpTimer {
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World) {
        let MptcpTimer { key } = *self;
        trace!(?key, now = ?sim.now(), "⏰ MPTCP 定时器到期");
        let w = NetWorld::from_world(world);
        // 规避同时借用 `w.net` 与 `w.net.mptcp`
        let mut stack = std::mem::take(&mut w.net.mptcp);
        stack.on_timer(key, sim, &mut w.net);
        w.net.mptcp = stack;
    }
}
