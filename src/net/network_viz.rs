//! 可视化记录
//!
//! 网络层事件（入队、发送、丢包、送达）与协议栈事件都落到同一个 [`VizLogger`]；
//! 没有开启 viz 时全部是空操作。
//!
//! [`VizLogger`]: crate::viz::VizLogger

use crate::proto::tcp::TcpFlags;
use crate::sim::SimTime;
use crate::viz::{VizEvent, VizEventKind, VizLinkInfo, VizNodeInfo, VizNodeKind, VizPacketKind};

use super::{Network, Packet, Transport};

/// 一个 packet 在 viz 事件里的公共字段；packet 入队后不可再借用，先取出来
#[derive(Debug, Clone, Copy)]
pub(crate) struct PktTag {
    id: u64,
    flow_id: u64,
    bytes: u32,
    kind: VizPacketKind,
}

impl PktTag {
    pub(crate) fn of(pkt: &Packet) -> Self {
        let kind = match &pkt.transport {
            Transport::Tcp(seg) if !seg.payload.is_empty() => VizPacketKind::Data,
            Transport::Tcp(seg) if seg.header.flags == TcpFlags::ACK => VizPacketKind::Ack,
            _ => VizPacketKind::Other,
        };
        Self {
            id: pkt.id,
            flow_id: pkt.flow_id,
            bytes: pkt.size_bytes,
            kind,
        }
    }
}

impl Network {
    pub(crate) fn viz_enabled(&self) -> bool {
        self.viz.is_some()
    }

    fn viz_push(&mut self, ev: VizEvent) {
        if let Some(v) = &mut self.viz {
            v.push(ev);
        }
    }

    /// 写入拓扑元信息（节点、链路、队列容量），应作为第一条事件
    pub fn emit_viz_meta(&mut self) {
        if !self.viz_enabled() {
            return;
        }
        let nodes = self
            .node_names
            .iter()
            .zip(&self.node_kinds)
            .enumerate()
            .map(|(id, (name, kind))| VizNodeInfo {
                id,
                name: name.clone(),
                kind: *kind,
            })
            .collect::<Vec<_>>();
        let links = self
            .links
            .iter()
            .map(|l| VizLinkInfo {
                from: l.from.0,
                to: l.to.0,
                bandwidth_bps: l.bandwidth_bps,
                latency_ns: l.latency.0,
                q_cap_bytes: l.queue.capacity_bytes(),
            })
            .collect::<Vec<_>>();
        self.viz_push(VizEvent {
            t_ns: 0,
            pkt_id: None,
            flow_id: None,
            pkt_bytes: None,
            pkt_kind: None,
            kind: VizEventKind::Meta { nodes, links },
        });
    }

    /// 与某个 packet 相关的网络层事件
    pub(crate) fn viz_pkt(&mut self, t: SimTime, tag: PktTag, kind: VizEventKind) {
        self.viz_push(VizEvent {
            t_ns: t.0,
            pkt_id: Some(tag.id),
            flow_id: Some(tag.flow_id),
            pkt_bytes: Some(tag.bytes),
            pkt_kind: Some(tag.kind),
            kind,
        });
    }

    /// 节点开始处理到达的 packet；节点名只在开启 viz 时才复制
    pub(crate) fn viz_node_rx(&mut self, t: SimTime, tag: PktTag, node: usize, node_name: &str) {
        if !self.viz_enabled() {
            return;
        }
        let node_kind = self.node_kinds.get(node).copied().unwrap_or(VizNodeKind::Switch);
        let kind = VizEventKind::NodeRx {
            node,
            node_kind,
            node_name: node_name.to_string(),
        };
        self.viz_pkt(t, tag, kind);
    }

    /// 协议栈事件（子流发送、映射、cwnd、状态迁移等）
    pub(crate) fn viz_proto(&mut self, t: SimTime, flow_id: u64, kind: VizEventKind) {
        let pkt_kind = match &kind {
            VizEventKind::SubflowSend { .. } | VizEventKind::MappingAdded { .. } => Some(VizPacketKind::Data),
            _ => None,
        };
        self.viz_push(VizEvent {
            t_ns: t.0,
            pkt_id: None,
            flow_id: Some(flow_id),
            pkt_bytes: None,
            pkt_kind,
            kind,
        });
    }
}
