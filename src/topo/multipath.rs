//! 多路径拓扑构建
//!
//! 拓扑结构（N 条互不相交的路径，每条一个路由器）：
//!
//! ```text
//!        +-- r0 --+
//!  c ----+-- r1 --+---- s
//!        +-- .. --+
//! ```
//!
//! 第 i 条路径上客户端地址为 `10.0.i.1`，服务端地址为 `10.0.i.2`；
//! 只安装同一条路径两端地址之间的静态路由。

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::net::{NetWorld, NodeId};
use crate::sim::SimTime;

/// 单条路径的参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSpec {
    /// 往返传播时延（不含序列化与排队）
    pub rtt: SimTime,
    /// 每条链路的带宽（bps）
    pub bandwidth_bps: u64,
    /// 路由器出口队列容量（bytes）；None 表示几乎无限
    pub queue_bytes: Option<u64>,
}

impl Default for PathSpec {
    fn default() -> Self {
        Self {
            rtt: SimTime::from_millis(10),
            bandwidth_bps: 100_000_000,
            queue_bytes: None,
        }
    }
}

/// 多路径拓扑配置选项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultipathOpts {
    pub paths: Vec<PathSpec>,
}

impl Default for MultipathOpts {
    fn default() -> Self {
        Self {
            paths: vec![
                PathSpec::default(),
                PathSpec {
                    rtt: SimTime::from_millis(50),
                    ..PathSpec::default()
                },
            ],
        }
    }
}

/// 构建结果
#[derive(Debug, Clone)]
pub struct Multipath {
    pub client: NodeId,
    pub server: NodeId,
    pub routers: Vec<NodeId>,
    /// 第 i 条路径上的客户端地址
    pub client_addrs: Vec<Ipv4Addr>,
    /// 第 i 条路径上的服务端地址
    pub server_addrs: Vec<Ipv4Addr>,
}

impl Multipath {
    pub fn path_count(&self) -> usize {
        self.routers.len()
    }
}

pub fn client_addr(path: usize) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, path as u8, 1)
}

pub fn server_addr(path: usize) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, path as u8, 2)
}

/// 构建多路径拓扑
pub fn build_multipath(world: &mut NetWorld, opts: &MultipathOpts) -> Multipath {
    let net = &mut world.net;
    let client = net.add_host("client");
    let server = net.add_host("server");
    let mut topo = Multipath {
        client,
        server,
        routers: Vec::with_capacity(opts.paths.len()),
        client_addrs: Vec::with_capacity(opts.paths.len()),
        server_addrs: Vec::with_capacity(opts.paths.len()),
    };

    for (i, p) in opts.paths.iter().enumerate() {
        let r = net.add_switch(format!("r{i}"));
        // 一个往返经过四段链路
        let latency = SimTime(p.rtt.0 / 4);
        net.connect(client, r, latency, p.bandwidth_bps);
        net.connect(r, client, latency, p.bandwidth_bps);
        net.connect(r, server, latency, p.bandwidth_bps);
        net.connect(server, r, latency, p.bandwidth_bps);
        if let Some(q) = p.queue_bytes {
            net.set_link_queue_capacity_bytes(r, server, q);
            net.set_link_queue_capacity_bytes(r, client, q);
        }

        let (ca, sa) = (client_addr(i), server_addr(i));
        net.add_address(client, ca);
        net.add_address(server, sa);
        net.add_route(ca, sa, vec![client, r, server]);
        net.add_route(sa, ca, vec![server, r, client]);

        topo.routers.push(r);
        topo.client_addrs.push(ca);
        topo.server_addrs.push(sa);
    }
    topo
}
