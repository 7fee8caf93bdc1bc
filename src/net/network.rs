//! 网络拓扑管理
//!
//! 定义网络拓扑结构，包含节点、链路、地址/路由表、数据包转发和统计信息。

use std::collections::HashMap;
use std::net::Ipv4Addr;

use super::deliver_packet::DeliverPacket;
use super::id::{LinkId, NodeId};
use super::link::Link;
use super::link_ready::LinkReady;
use super::network_viz::PktTag;
use super::node::{Host, Node, Switch};
use super::packet::Packet;
use super::stats::Stats;
use super::transport::Transport;
use crate::proto::mptcp::MptcpStack;
use crate::queue::DropTailQueue;
use crate::sim::{SimTime, Simulator};
use crate::viz::{VizEventKind, VizLogger, VizNodeKind};
use tracing::{debug, trace, warn};

/// 网络拓扑
#[derive(Default)]
pub struct Network {
    pub(crate) nodes: Vec<Option<Box<dyn Node>>>,
    pub(crate) links: Vec<Link>,
    edges: HashMap<(NodeId, NodeId), LinkId>,
    next_pkt_id: u64,
    /// 接口地址 -> 所在主机
    addrs: HashMap<Ipv4Addr, NodeId>,
    /// (源地址, 目的地址) -> 节点路径（含两端主机）
    routes: HashMap<(Ipv4Addr, Ipv4Addr), Vec<NodeId>>,
    pub(crate) node_names: Vec<String>,
    pub(crate) node_kinds: Vec<VizNodeKind>,
    pub stats: Stats,
    pub viz: Option<VizLogger>,
    /// 所有主机共享的 MPTCP 协议栈（按 host 区分 token/监听表）
    pub mptcp: MptcpStack,
}

impl Network {
    /// 添加主机节点
    pub fn add_host(&mut self, name: impl Into<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        let name = name.into();
        self.node_names.push(name.clone());
        self.node_kinds.push(VizNodeKind::Host);
        self.nodes.push(Some(Box::new(Host::new(id, name))));
        id
    }

    /// 添加交换机节点
    pub fn add_switch(&mut self, name: impl Into<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        let name = name.into();
        self.node_names.push(name.clone());
        self.node_kinds.push(VizNodeKind::Switch);
        self.nodes.push(Some(Box::new(Switch::new(id, name))));
        id
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// 连接两个节点（创建单向链路）
    pub fn connect(
        &mut self,
        from: NodeId,
        to: NodeId,
        latency: SimTime,
        bandwidth_bps: u64,
    ) -> LinkId {
        let id = LinkId(self.links.len());
        self.links.push(Link::new(from, to, latency, bandwidth_bps));
        self.edges.insert((from, to), id);
        id
    }

    pub fn link_between(&self, from: NodeId, to: NodeId) -> Option<LinkId> {
        self.edges.get(&(from, to)).copied()
    }

    /// 单向链路出口队列的历史最大排队字节数
    pub fn queue_peak_bytes(&self, from: NodeId, to: NodeId) -> Option<u64> {
        self.link_between(from, to).map(|id| self.links[id.0].queue.peak_bytes())
    }

    /// 设置单向链路的 DropTail 队列容量（bytes）
    pub fn set_link_queue_capacity_bytes(&mut self, from: NodeId, to: NodeId, cap_bytes: u64) {
        if let Some(id) = self.link_between(from, to) {
            self.links[id.0].queue = Box::new(DropTailQueue::new(cap_bytes));
        } else {
            warn!(%from, %to, "设置队列容量：链路不存在");
        }
    }

    /// 中断/恢复单向链路；中断期间经过它的 packet 全部丢弃
    pub fn set_link_up(&mut self, from: NodeId, to: NodeId, up: bool) {
        if let Some(id) = self.link_between(from, to) {
            debug!(%from, %to, up, "🔌 链路状态变更");
            self.links[id.0].up = up;
        } else {
            warn!(%from, %to, "设置链路状态：链路不存在");
        }
    }

    /// 给主机分配一个接口地址
    pub fn add_address(&mut self, host: NodeId, addr: Ipv4Addr) {
        if let Some(prev) = self.addrs.insert(addr, host) {
            if prev != host {
                warn!(%addr, %prev, %host, "地址被重新分配到另一台主机");
            }
        }
    }

    pub fn host_of(&self, addr: Ipv4Addr) -> Option<NodeId> {
        self.addrs.get(&addr).copied()
    }

    /// 安装一条静态路由：从 `src` 地址发往 `dst` 地址的段沿 `path` 走
    pub fn add_route(&mut self, src: Ipv4Addr, dst: Ipv4Addr, path: Vec<NodeId>) {
        debug_assert!(path.len() >= 2, "route needs at least two nodes");
        self.routes.insert((src, dst), path);
    }

    pub fn route(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Option<&[NodeId]> {
        self.routes.get(&(src, dst)).map(Vec::as_slice)
    }

    /// 创建数据包
    pub fn make_packet(&mut self, flow_id: u64, size_bytes: u32, route: Vec<NodeId>, transport: Transport) -> Packet {
        let id = self.next_pkt_id;
        self.next_pkt_id = self.next_pkt_id.wrapping_add(1);
        Packet {
            id,
            flow_id,
            size_bytes,
            route,
            hop: 0,
            transport,
        }
    }

    /// 将数据包交付给节点处理
    #[tracing::instrument(skip(self, pkt, sim), fields(pkt_id = pkt.id, to = %to))]
    pub fn deliver(&mut self, to: NodeId, pkt: Packet, sim: &mut Simulator) {
        debug!("📬 将数据包交付给节点处理");
        let (now, tag) = (sim.now(), PktTag::of(&pkt));
        self.viz_pkt(now, tag, VizEventKind::ArriveNode { node: to.0 });

        // 暂时把节点取出来，避免 &mut self 与 &mut node 的重叠借用。
        let Some(mut node) = self.nodes.get_mut(to.0).and_then(Option::take) else {
            warn!("节点不存在或正在处理中，丢弃");
            self.drop_packet(pkt);
            return;
        };
        self.viz_node_rx(now, tag, to.0, node.name());

        node.on_packet(pkt, sim, self);

        trace!("节点处理完成，放回节点");
        self.nodes[to.0] = Some(node);
    }

    /// 从指定节点转发数据包：入队到下一跳链路，必要时立即开始发送
    #[tracing::instrument(skip(self, pkt, sim), fields(pkt_id = pkt.id, from = %from, hop = pkt.hop))]
    pub fn forward_from(&mut self, from: NodeId, pkt: Packet, sim: &mut Simulator) {
        let Some(to) = pkt.next() else {
            warn!("没有下一跳，丢弃");
            self.drop_packet(pkt);
            return;
        };
        let Some(link_id) = self.link_between(from, to) else {
            warn!(%to, "没有到下一跳的链路，丢弃");
            self.drop_packet(pkt);
            return;
        };
        let (now, tag) = (sim.now(), PktTag::of(&pkt));
        self.viz_pkt(now, tag, VizEventKind::NodeForward { node: from.0, next: to.0 });

        let link = &mut self.links[link_id.0];
        if !link.up {
            debug!(%to, "🔌 链路中断，丢包");
            self.drop_on_link(link_id, now, pkt);
            return;
        }
        match link.queue.enqueue(pkt) {
            Ok(()) => {
                let (q_bytes, q_cap_bytes) = (link.queue.bytes(), link.queue.capacity_bytes());
                trace!(q_bytes, "入队");
                let kind = VizEventKind::Enqueue {
                    link_from: from.0,
                    link_to: to.0,
                    q_bytes,
                    q_cap_bytes,
                };
                self.viz_pkt(now, tag, kind);
                self.try_transmit(link_id, sim);
            }
            Err(pkt) => {
                debug!(q_bytes = link.queue.bytes(), cap_bytes = link.queue.capacity_bytes(), "🗑️ DropTail 丢包");
                self.drop_on_link(link_id, now, pkt);
            }
        }
    }

    /// 在链路入口丢弃：记 viz 与统计
    fn drop_on_link(&mut self, link_id: LinkId, now: SimTime, pkt: Packet) {
        let link = &self.links[link_id.0];
        let kind = VizEventKind::Drop {
            link_from: link.from.0,
            link_to: link.to.0,
            q_bytes: link.queue.bytes(),
            q_cap_bytes: link.queue.capacity_bytes(),
        };
        self.viz_pkt(now, PktTag::of(&pkt), kind);
        self.drop_packet(pkt);
    }

    /// 链路序列化完成，继续发送队首
    pub(crate) fn on_link_ready(&mut self, link_id: LinkId, sim: &mut Simulator) {
        self.try_transmit(link_id, sim);
    }

    fn try_transmit(&mut self, link_id: LinkId, sim: &mut Simulator) {
        let now = sim.now();
        let link = &mut self.links[link_id.0];
        if link.busy_until > now {
            // 正在发送；LinkReady 到期时再出队
            return;
        }
        let Some(pkt) = link.queue.dequeue() else {
            return;
        };
        let tx_time = link.tx_time(pkt.size_bytes);
        let depart = now.saturating_add(tx_time);
        let arrive = depart.saturating_add(link.latency);
        link.busy_until = depart;
        let (from, to) = (link.from, link.to);

        trace!(?now, ?tx_time, ?depart, ?arrive, "计算传输时间");
        let kind = VizEventKind::TxStart {
            link_from: from.0,
            link_to: to.0,
            depart_ns: depart.0,
            arrive_ns: arrive.0,
        };
        self.viz_pkt(now, PktTag::of(&pkt), kind);

        sim.schedule(depart, LinkReady { link_id });
        sim.schedule(arrive, DeliverPacket { to, pkt: pkt.advance() });
    }

    pub(crate) fn drop_packet(&mut self, pkt: Packet) {
        self.stats.dropped_pkts += 1;
        self.stats.dropped_bytes += pkt.size_bytes as u64;
    }
}
