//! 发起连接的事件

use std::net::SocketAddrV4;

use tracing::warn;

use crate::net::with_mptcp_stack;
use crate::proto::mptcp::ConnId;
use crate::sim::{Event, Simulator, World};

/// 事件：在仿真时刻对已绑定的套接字发起主动打开
#[derive(Debug)]
pub struct StartConnect {
    pub conn: ConnId,
    pub remote: SocketAddrV4,
}

impl Event for StartConnect {
    fn execute(self: Box<Self>, sim: &mut Simulator, world: &mut dyn World) {
        let StartConnect { conn, remote } = *self;
        let r = with_mptcp_stack(world, |net, stack| stack.connect(conn, remote, sim, net));
        if let Err(e) = r {
            warn!(conn, %remote, error = %e, "发起连接失败");
        }
    }
}
