//! packet 到达事件

use super::id::NodeId;
use super::net_world::NetWorld;
use super::packet::Packet;
use crate::sim::{Event, Simulator, World};
use tracing::debug;

/// 事件：packet 经过链路传播后到达 `to`
#[derive(Debug)]
pub struct DeliverPacket {
    pub to: NodeId,
    pub pkt: Packet,
}

impl Event for DeliverPacket {
    #[tracing::instrument(skip_all, fields(pkt_id = self.pkt.id, flow_id = self.pkt.flow_id, to = %self.to))]
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World) {
        let DeliverPacket { to, pkt } = *self;
        debug!(
            size_bytes = pkt.size_bytes,
            dst = %pkt.dst(),
            hop = pkt.hop,
            now = ?sim.now(),
            "📨 数据包到达节点"
        );
        NetWorld::from_world(world).net.deliver(to, pkt, sim);
    }
}
