//! 多路径拓扑上的端到端传输

use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};

use crate::app::{BulkSend, BulkSendConfig, BulkSendReport, SinkConfig, StartConnect, first_pattern_mismatch, setup_bulk_transfer};
use crate::net::{NetWorld, NodeId};
use crate::proto::mptcp::{MptcpConfig, MptcpStack};
use crate::proto::tcp::{SeqNum, TcpFlags, TcpHeader, TcpSegment};
use crate::queue::mem_from_pkt;
use crate::sim::{Event, SimTime, Simulator, World};
use crate::topo::multipath::{Multipath, MultipathOpts, PathSpec, build_multipath};
use crate::viz::{VizEventKind, VizLogger};

const PORT: u16 = 5000;

fn two_paths(bandwidth_bps: u64, queue_bytes: Option<u64>) -> MultipathOpts {
    MultipathOpts {
        paths: [10, 50]
            .into_iter()
            .map(|ms| PathSpec {
                rtt: SimTime::from_millis(ms),
                bandwidth_bps,
                queue_bytes,
            })
            .collect(),
    }
}

fn world_with(cfg: MptcpConfig, opts: &MultipathOpts) -> (NetWorld, Multipath) {
    let mut world = NetWorld::default();
    world.net.mptcp = MptcpStack::new(cfg);
    world.net.viz = Some(VizLogger::default());
    let topo = build_multipath(&mut world, opts);
    (world, topo)
}

fn mappings_per_subflow(world: &NetWorld, conn: u64) -> BTreeMap<usize, u64> {
    let mut out = BTreeMap::new();
    for ev in &world.net.viz.as_ref().expect("viz enabled").events {
        if let VizEventKind::MappingAdded { conn: c, subflow, .. } = ev.kind {
            if c == conn {
                *out.entry(subflow).or_default() += 1;
            }
        }
    }
    out
}

/// 事件：中断一条路径上客户端与路由器之间的双向链路
struct PathDown {
    client: NodeId,
    router: NodeId,
}

impl Event for PathDown {
    fn execute(self: Box<Self>, _sim: &mut Simulator, world: &mut dyn World) {
        let w = NetWorld::from_world(world);
        w.net.set_link_up(self.client, self.router, false);
        w.net.set_link_up(self.router, self.client, false);
    }
}

#[test]
fn two_path_transfer_delivers_every_byte_over_both_subflows() {
    let (mut world, topo) = world_with(MptcpConfig::default(), &two_paths(10_000_000, None));
    let mut sim = Simulator::default();
    let bulk = BulkSendConfig {
        total_bytes: 1_000_000,
        write_size: 100,
        ..BulkSendConfig::default()
    };
    let sink = SinkConfig {
        read_size: 20,
        keep_data: true,
    };
    let xfer = setup_bulk_transfer(&mut world, &mut sim, &topo, bulk, sink, PORT, SimTime::ZERO).expect("setup");

    sim.run_until(SimTime::from_secs(60), &mut world);

    let sender = xfer.sender.lock().expect("lock").clone();
    let sink = xfer.sink.lock().expect("lock").clone();
    assert_eq!(sender.bytes_written, 1_000_000);
    assert!(sender.writes >= 10_000);
    assert!(sender.fully_established_at.is_some());
    assert_eq!(sender.subflows_connected.len(), 2, "{sender:?}");
    assert!(sender.join_errors.is_empty(), "{:?}", sender.join_errors);

    assert_eq!(sink.bytes_received, 1_000_000);
    assert_eq!(sink.data.len(), 1_000_000);
    assert_eq!(first_pattern_mismatch(&sink.data), None);
    assert!(sink.reads >= 1_000_000 / 20);

    let mappings = mappings_per_subflow(&world, xfer.client);
    assert_eq!(mappings.len(), 2, "mappings per subflow: {mappings:?}");
    assert!(mappings.values().all(|&n| n > 0));
}

#[test]
fn transfer_closes_both_ends_through_data_fin() {
    let (mut world, topo) = world_with(MptcpConfig::default(), &two_paths(100_000_000, None));
    let mut sim = Simulator::default();
    let bulk = BulkSendConfig {
        total_bytes: 50_000,
        write_size: 1_000,
        ..BulkSendConfig::default()
    };
    let xfer = setup_bulk_transfer(&mut world, &mut sim, &topo, bulk, SinkConfig::default(), PORT, SimTime::ZERO)
        .expect("setup");

    sim.run_until(SimTime::from_secs(60), &mut world);

    let sender = xfer.sender.lock().expect("lock").clone();
    let sink = xfer.sink.lock().expect("lock").clone();
    assert_eq!(sink.bytes_received, 50_000);
    assert!(sink.peer_closed_at.is_some());
    let (Some(written), Some(closed)) = (sender.all_written_at, sender.closed_at) else {
        panic!("sender did not close: {sender:?}");
    };
    assert!(written <= closed);
    assert!(sink.closed_at.is_some(), "{sink:?}");
    assert!(!sender.reset && !sink.reset);
}

#[test]
fn connecting_to_a_port_without_listener_fails_by_reset() {
    let (mut world, topo) = world_with(MptcpConfig::default(), &two_paths(100_000_000, None));
    let mut sim = Simulator::default();

    let report = Arc::new(Mutex::new(BulkSendReport::default()));
    let stack = &mut world.net.mptcp;
    let app = stack.register_app(Box::new(BulkSend::new(BulkSendConfig::default(), Arc::clone(&report))));
    let conn = stack.create_socket(topo.client, app);
    stack
        .bind(conn, SocketAddrV4::new(topo.client_addrs[0], PORT))
        .expect("bind");
    sim.schedule(
        SimTime::ZERO,
        StartConnect {
            conn,
            remote: SocketAddrV4::new(topo.server_addrs[0], 6000),
        },
    );

    sim.run_until(SimTime::from_secs(10), &mut world);

    let report = report.lock().expect("lock").clone();
    assert!(report.connect_failed, "{report:?}");
    assert!(report.connected_at.is_none());
    assert_eq!(report.bytes_written, 0);
    // SYN 与 RST 各一个
    assert_eq!(world.net.stats.delivered_pkts, 2);
}

#[test]
fn plain_tcp_syn_is_answered_with_reset() {
    let (mut world, topo) = world_with(MptcpConfig::default(), &two_paths(100_000_000, None));
    let mut sim = Simulator::default();
    setup_bulk_transfer(
        &mut world,
        &mut sim,
        &topo,
        BulkSendConfig::default(),
        SinkConfig::default(),
        PORT,
        SimTime::from_secs(1),
    )
    .expect("setup");

    // 不带 MPTCP 选项的 SYN 打到监听端口
    let src = SocketAddrV4::new(topo.client_addrs[1], 7000);
    let dst = SocketAddrV4::new(topo.server_addrs[1], PORT);
    let syn = TcpSegment::new(TcpHeader::new(src, dst, TcpFlags::SYN, SeqNum(42), SeqNum(0), 65_535), Vec::new());
    world.net.send_segment(0, syn, &mut sim);

    sim.run_until(SimTime::from_millis(500), &mut world);

    let rsts = world
        .net
        .viz
        .as_ref()
        .expect("viz enabled")
        .events
        .iter()
        .filter(|ev| matches!(ev.kind, VizEventKind::Delivered { node } if node == topo.client.0))
        .count();
    assert_eq!(world.net.stats.delivered_pkts, 2);
    assert_eq!(rsts, 1);
}

#[test]
fn lossy_bottleneck_still_delivers_in_order() {
    let opts = two_paths(10_000_000, Some(mem_from_pkt(8)));
    let (mut world, topo) = world_with(MptcpConfig::default(), &opts);
    // 路由器到服务端的出口比接入链路慢，队列才会堆积
    for &r in &topo.routers {
        let id = world.net.link_between(r, topo.server).expect("router -> server link");
        world.net.links[id.0].bandwidth_bps = 2_000_000;
    }
    let mut sim = Simulator::default();
    let bulk = BulkSendConfig {
        total_bytes: 400_000,
        write_size: 1_000,
        ..BulkSendConfig::default()
    };
    let xfer = setup_bulk_transfer(&mut world, &mut sim, &topo, bulk, SinkConfig::default(), PORT, SimTime::ZERO)
        .expect("setup");

    sim.run_until(SimTime::from_secs(120), &mut world);

    let sink = xfer.sink.lock().expect("lock").clone();
    assert!(world.net.stats.dropped_pkts > 0, "bottleneck never dropped");
    assert_eq!(sink.bytes_received, 400_000);
    assert_eq!(first_pattern_mismatch(&sink.data), None);
}

#[test]
fn failed_path_data_is_reinjected_on_the_surviving_subflow() {
    let mut cfg = MptcpConfig::default();
    cfg.tcp.data_retries = 3;
    let (mut world, topo) = world_with(cfg, &two_paths(10_000_000, None));
    let mut sim = Simulator::default();
    let bulk = BulkSendConfig {
        total_bytes: 600_000,
        write_size: 1_000,
        ..BulkSendConfig::default()
    };
    let xfer = setup_bulk_transfer(&mut world, &mut sim, &topo, bulk, SinkConfig::default(), PORT, SimTime::ZERO)
        .expect("setup");
    sim.schedule(
        SimTime::from_millis(300),
        PathDown {
            client: topo.client,
            router: topo.routers[0],
        },
    );

    sim.run_until(SimTime::from_secs(120), &mut world);

    let sender = xfer.sender.lock().expect("lock").clone();
    let sink = xfer.sink.lock().expect("lock").clone();
    assert!(!sender.reset, "{sender:?}");
    assert_eq!(sink.bytes_received, 600_000);
    assert_eq!(first_pattern_mismatch(&sink.data), None);

    let rtos = world
        .net
        .viz
        .as_ref()
        .expect("viz enabled")
        .events
        .iter()
        .filter(|ev| matches!(ev.kind, VizEventKind::SubflowRto { conn, subflow: 0, .. } if conn == xfer.client))
        .count();
    assert!(rtos > 0);
}

#[test]
fn keys_are_reproducible_for_the_same_seed() {
    let handshake_keys = |seed: u64| {
        let cfg = MptcpConfig {
            key_seed: seed,
            ..MptcpConfig::default()
        };
        let (mut world, topo) = world_with(cfg, &two_paths(100_000_000, None));
        let mut sim = Simulator::default();
        let xfer = setup_bulk_transfer(
            &mut world,
            &mut sim,
            &topo,
            BulkSendConfig::default(),
            SinkConfig::default(),
            PORT,
            SimTime::ZERO,
        )
        .expect("setup");
        // 握手在 10ms 路径上一个 RTT 内完成
        sim.run_until(SimTime::from_millis(30), &mut world);
        let meta = world.net.mptcp.meta(xfer.client).expect("client meta");
        (meta.local_key().map(|k| k.key), meta.peer_key().map(|k| k.key))
    };

    let first = handshake_keys(7);
    assert!(first.0.is_some() && first.1.is_some());
    assert_ne!(first.0, first.1);
    assert_eq!(first, handshake_keys(7));
    assert_ne!(first.0, handshake_keys(8).0);
}
