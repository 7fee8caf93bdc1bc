//! Network-facing API used by protocol stacks.

use crate::proto::tcp::TcpSegment;
use crate::sim::{SimTime, Simulator};
use crate::viz::VizEventKind;

/// Minimal network API for protocol stacks.
pub trait NetApi {
    /// Route `seg` by its (src ip, dst ip) pair; unroutable segments are dropped.
    fn send_segment(&mut self, flow_id: u64, seg: TcpSegment, sim: &mut Simulator);

    /// Record a protocol-level visualization event (no-op when viz is off).
    fn viz_mptcp(&mut self, t: SimTime, flow_id: u64, kind: VizEventKind);
}

impl NetApi for super::Network {
    fn send_segment(&mut self, flow_id: u64, seg: TcpSegment, sim: &mut Simulator) {
        super::Network::send_segment(self, flow_id, seg, sim)
    }

    fn viz_mptcp(&mut self, t: SimTime, flow_id: u64, kind: VizEventKind) {
        self.viz_proto(t, flow_id, kind)
    }
}
