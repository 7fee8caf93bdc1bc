use std::net::{Ipv4Addr, SocketAddrV4};

use crate::net::{IPV4_HEADER_BYTES, NetWorld};
use crate::proto::tcp::{SeqNum, TcpFlags, TcpHeader, TcpSegment};
use crate::sim::{SimTime, Simulator};
use crate::topo::multipath::{MultipathOpts, PathSpec, build_multipath, client_addr, server_addr};

fn three_paths() -> MultipathOpts {
    MultipathOpts {
        paths: vec![
            PathSpec {
                rtt: SimTime::from_millis(8),
                bandwidth_bps: 1_000_000_000,
                queue_bytes: Some(30_000),
            },
            PathSpec {
                rtt: SimTime::from_millis(40),
                ..PathSpec::default()
            },
            PathSpec {
                rtt: SimTime::from_millis(100),
                bandwidth_bps: 8_000_000,
                queue_bytes: None,
            },
        ],
    }
}

#[test]
fn multipath_builds_one_router_and_address_pair_per_path() {
    let mut world = NetWorld::default();
    let topo = build_multipath(&mut world, &three_paths());

    assert_eq!(topo.path_count(), 3);
    assert_eq!(world.net.node_count(), 5);
    assert_eq!(topo.client_addrs, vec![client_addr(0), client_addr(1), client_addr(2)]);
    assert_eq!(topo.server_addrs[2], Ipv4Addr::new(10, 0, 2, 2));

    for i in 0..topo.path_count() {
        assert_eq!(world.net.host_of(client_addr(i)), Some(topo.client));
        assert_eq!(world.net.host_of(server_addr(i)), Some(topo.server));
        let r = topo.routers[i];
        assert_eq!(
            world.net.route(client_addr(i), server_addr(i)),
            Some(&[topo.client, r, topo.server][..])
        );
        assert_eq!(
            world.net.route(server_addr(i), client_addr(i)),
            Some(&[topo.server, r, topo.client][..])
        );
    }
    // 不同路径的地址之间没有路由
    assert_eq!(world.net.route(client_addr(0), server_addr(1)), None);
}

#[test]
fn multipath_links_split_rtt_and_cap_router_egress() {
    let mut world = NetWorld::default();
    let topo = build_multipath(&mut world, &three_paths());

    let r0 = topo.routers[0];
    let up = world.net.link_between(topo.client, r0).expect("client -> r0");
    let down = world.net.link_between(r0, topo.client).expect("r0 -> client");
    let to_server = world.net.link_between(r0, topo.server).expect("r0 -> server");

    let links = &world.net.links;
    assert_eq!(links[up.0].latency, SimTime::from_millis(2));
    assert_eq!(links[up.0].bandwidth_bps, 1_000_000_000);
    assert_eq!(links[up.0].queue.capacity_bytes(), u64::MAX);
    assert_eq!(links[down.0].queue.capacity_bytes(), 30_000);
    assert_eq!(links[to_server.0].queue.capacity_bytes(), 30_000);
    assert!(world.net.link_between(topo.client, topo.server).is_none());
}

#[test]
fn multipath_segment_takes_half_the_path_rtt() {
    let mut world = NetWorld::default();
    let topo = build_multipath(&mut world, &three_paths());
    let mut sim = Simulator::default();

    let h = TcpHeader::new(
        SocketAddrV4::new(topo.client_addrs[2], 4000),
        SocketAddrV4::new(topo.server_addrs[2], 5000),
        TcpFlags::RST,
        SeqNum(1),
        SeqNum(0),
        0,
    );
    let seg = TcpSegment::new(h, vec![0u8; 460]);
    let bytes = seg.wire_len() as u64 + IPV4_HEADER_BYTES as u64;
    world.net.send_segment(1, seg, &mut sim);
    sim.run(&mut world);

    // 两跳各序列化一次（8 Mbps：每字节 1 微秒），加上 RTT 的一半
    assert_eq!(world.net.stats.delivered_pkts, 1);
    assert_eq!(sim.now(), SimTime::from_micros(2 * bytes + 50_000));
}
