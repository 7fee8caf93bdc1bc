//! Transport-layer payload carried by packets.

use crate::proto::tcp::TcpSegment;

/// Packet transport payload.
///
/// `Packet` is a network-layer carrier; the transport payload lets the protocol stack ride on it
/// without coupling the network to protocol implementations.
#[derive(Debug, Clone, Default)]
pub enum Transport {
    /// No transport payload (default).
    #[default]
    None,
    /// A TCP segment (MPTCP options travel inside its header).
    Tcp(TcpSegment),
}
