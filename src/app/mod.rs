//! 演示应用
//!
//! - `BulkSend`：按固定写入大小灌满发送缓冲区，写完后关闭
//! - `Sink`：按固定读取大小收数据，对端关闭后关闭
//! - `setup_bulk_transfer`：在多路径拓扑上把两者连起来

mod bulk_send;
mod connect;
mod sink;

use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::net::{NetWorld, with_mptcp_stack};
use crate::proto::mptcp::{ConnId, Result};
use crate::sim::{SimTime, Simulator};
use crate::topo::multipath::Multipath;

pub use bulk_send::{BulkSend, BulkSendConfig, BulkSendReport};
pub use connect::StartConnect;
pub use sink::{Sink, SinkConfig, SinkReport};

/// 发送方写入的确定性字节序列
pub fn pattern_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// 检查 `data` 是否为从 0 开始的模式序列；返回第一个不一致的位置
pub fn first_pattern_mismatch(data: &[u8]) -> Option<usize> {
    data.iter()
        .enumerate()
        .position(|(i, b)| *b != pattern_byte(i as u64))
}

/// 一次批量传输的句柄
#[derive(Debug, Clone)]
pub struct BulkTransfer {
    pub listener: ConnId,
    pub client: ConnId,
    pub server_addr: SocketAddrV4,
    pub sender: Arc<Mutex<BulkSendReport>>,
    pub sink: Arc<Mutex<SinkReport>>,
}

/// 在服务端第一条路径地址上监听，客户端在 `start` 时刻从第一条路径发起连接。
///
/// `bulk.extra_paths` 为空时，自动填入其余各条路径的 (客户端, 服务端) 地址对。
pub fn setup_bulk_transfer(
    world: &mut NetWorld,
    sim: &mut Simulator,
    topo: &Multipath,
    mut bulk: BulkSendConfig,
    sink: SinkConfig,
    port: u16,
    start: SimTime,
) -> Result<BulkTransfer> {
    let server_addr = SocketAddrV4::new(topo.server_addrs[0], port);
    let client_addr = SocketAddrV4::new(topo.client_addrs[0], port);
    if bulk.extra_paths.is_empty() {
        bulk.extra_paths = (1..topo.path_count())
            .map(|i| {
                (
                    SocketAddrV4::new(topo.client_addrs[i], port),
                    SocketAddrV4::new(topo.server_addrs[i], port),
                )
            })
            .collect();
    }

    let sink_report = Arc::new(Mutex::new(SinkReport::default()));
    let sender_report = Arc::new(Mutex::new(BulkSendReport::default()));

    let stack = &mut world.net.mptcp;
    let sink_app = stack.register_app(Box::new(Sink::new(sink, Arc::clone(&sink_report))));
    let send_app = stack.register_app(Box::new(BulkSend::new(bulk, Arc::clone(&sender_report))));

    let listener = stack.create_socket(topo.server, sink_app);
    stack.bind(listener, server_addr)?;
    let client = stack.create_socket(topo.client, send_app);
    stack.bind(client, client_addr)?;
    with_mptcp_stack(world, |net, stack| stack.listen(listener, sim, net))?;

    info!(listener, client, %server_addr, ?start, "📦 批量传输就绪");
    sim.schedule(
        start,
        StartConnect {
            conn: client,
            remote: server_addr,
        },
    );

    Ok(BulkTransfer {
        listener,
        client,
        server_addr,
        sender: sender_report,
        sink: sink_report,
    })
}
