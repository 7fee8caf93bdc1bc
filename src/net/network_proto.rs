//! Protocol dispatch hooks for the network.

use crate::proto::mptcp::MptcpStack;
use crate::proto::tcp::TcpSegment;
use crate::sim::{Simulator, World};
use tracing::{debug, info, warn};

use super::network_viz::PktTag;
use super::{NetApi, NetWorld, Network, NodeId, Packet, Transport};
use crate::viz::VizEventKind;

/// IPv4 头部字节数（计入链路序列化时间）
pub const IPV4_HEADER_BYTES: u32 = 20;

impl Network {
    /// 按 (源地址, 目的地址) 查路由，把段封装成 packet 从源主机发出
    #[tracing::instrument(skip(self, seg, sim), fields(src = %seg.header.src, dst = %seg.header.dst))]
    pub fn send_segment(&mut self, flow_id: u64, seg: TcpSegment, sim: &mut Simulator) {
        let (src, dst) = (*seg.header.src.ip(), *seg.header.dst.ip());
        let Some(route) = self.route(src, dst).map(<[NodeId]>::to_vec) else {
            warn!(%src, %dst, flags = %seg.header.flags, "没有路由，丢弃段");
            self.stats.unroutable += 1;
            return;
        };
        let size = seg.wire_len() as u32 + IPV4_HEADER_BYTES;
        let pkt = self.make_packet(flow_id, size, route, Transport::Tcp(seg));
        debug!(pkt_id = pkt.id, size_bytes = size, "📤 发送段");
        let from = pkt.src();
        self.forward_from(from, pkt, sim);
    }

    /// 数据包送达目的地时的处理
    #[tracing::instrument(skip(self, pkt, sim), fields(pkt_id = pkt.id, flow_id = pkt.flow_id))]
    pub(crate) fn on_delivered(&mut self, at: NodeId, pkt: Packet, sim: &mut Simulator) {
        info!("✅ 数据包送达目的地");

        self.viz_pkt(sim.now(), PktTag::of(&pkt), VizEventKind::Delivered { node: at.0 });

        self.stats.delivered_pkts += 1;
        self.stats.delivered_bytes += pkt.size_bytes as u64;

        debug!(
            size_bytes = pkt.size_bytes,
            delivered_pkts = self.stats.delivered_pkts,
            delivered_bytes = self.stats.delivered_bytes,
            "更新统计信息"
        );

        // 传输层处理：交给本机的 MPTCP 协议栈分发
        if let Transport::Tcp(seg) = pkt.transport {
            let mut stack = std::mem::take(&mut self.mptcp);
            stack.on_segment(at, seg, sim, self);
            self.mptcp = stack;
        }
    }
}

/// 从仿真世界里同时拿到 `NetApi` 与 MPTCP 协议栈
pub fn with_mptcp_stack<F, R>(world: &mut dyn World, f: F) -> R
where
    F: FnOnce(&mut dyn NetApi, &mut MptcpStack) -> R,
{
    let w = NetWorld::from_world(world);
    let mut stack = std::mem::take(&mut w.net.mptcp);
    let result = f(&mut w.net, &mut stack);
    w.net.mptcp = stack;
    result
}
