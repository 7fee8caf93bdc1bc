use crate::app::{BulkSendConfig, SinkConfig, setup_bulk_transfer};
use crate::net::NetWorld;
use crate::sim::{SimTime, Simulator};
use crate::topo::multipath::{MultipathOpts, build_multipath};
use crate::viz::{VizEventKind, VizLogger, VizNodeKind};
use std::collections::HashMap;

#[test]
fn viz_meta_includes_nodes_links_and_queue_caps() {
    let mut world = NetWorld::default();
    let h0 = world.net.add_host("h0");
    let h1 = world.net.add_host("h1");

    let latency = SimTime::from_micros(2);
    let bw = 10_u64 * 1_000_000_000;

    world.net.connect(h0, h1, latency, bw);
    world.net.connect(h1, h0, latency, bw);
    world.net.set_link_queue_capacity_bytes(h0, h1, 111);
    world.net.set_link_queue_capacity_bytes(h1, h0, 222);

    world.net.viz = Some(VizLogger::default());
    world.net.emit_viz_meta();

    let events = &world.net.viz.as_ref().expect("viz enabled").events;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].t_ns, 0);

    let (nodes, links) = match &events[0].kind {
        VizEventKind::Meta { nodes, links } => (nodes, links),
        _ => panic!("expected Meta event"),
    };

    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].id, h0.0);
    assert_eq!(nodes[0].name, "h0");
    assert!(matches!(nodes[0].kind, VizNodeKind::Host));
    assert_eq!(nodes[1].id, h1.0);
    assert_eq!(nodes[1].name, "h1");
    assert!(matches!(nodes[1].kind, VizNodeKind::Host));

    let by_pair = links
        .iter()
        .map(|l| ((l.from, l.to), l))
        .collect::<HashMap<_, _>>();
    let l01 = by_pair.get(&(h0.0, h1.0)).expect("missing h0->h1");
    assert_eq!(l01.bandwidth_bps, bw);
    assert_eq!(l01.latency_ns, latency.0);
    assert_eq!(l01.q_cap_bytes, 111);

    let l10 = by_pair.get(&(h1.0, h0.0)).expect("missing h1->h0");
    assert_eq!(l10.bandwidth_bps, bw);
    assert_eq!(l10.latency_ns, latency.0);
    assert_eq!(l10.q_cap_bytes, 222);
}

#[test]
fn viz_json_starts_with_meta_and_carries_protocol_events() {
    let mut world = NetWorld::default();
    let topo = build_multipath(&mut world, &MultipathOpts::default());
    world.net.viz = Some(VizLogger::default());
    world.net.emit_viz_meta();

    let mut sim = Simulator::default();
    let bulk = BulkSendConfig {
        total_bytes: 20_000,
        write_size: 1_000,
        ..BulkSendConfig::default()
    };
    let xfer = setup_bulk_transfer(&mut world, &mut sim, &topo, bulk, SinkConfig::default(), 5000, SimTime::ZERO)
        .expect("setup");
    sim.run_until(SimTime::from_secs(10), &mut world);
    assert_eq!(xfer.sink.lock().expect("lock").bytes_received, 20_000);

    let events = &world.net.viz.as_ref().expect("viz enabled").events;
    let json = serde_json::to_value(events).expect("serialize");
    let arr = json.as_array().expect("array");
    assert_eq!(arr[0]["kind"], "meta");
    let kinds = arr[0]["nodes"]
        .as_array()
        .expect("nodes")
        .iter()
        .map(|n| n["kind"].as_str().expect("kind").to_string())
        .collect::<Vec<_>>();
    assert_eq!(kinds, ["host", "host", "switch", "switch"]);

    let has = |kind: &str| arr.iter().any(|e| e["kind"] == kind && e["conn"] == xfer.client);
    assert!(has("subflow_send"));
    assert!(has("mapping_added"));
    assert!(has("meta_state"));
    assert!(arr.iter().any(|e| e["kind"] == "delivered"));

    // 事件按仿真时间有序
    let times = arr.iter().map(|e| e["t_ns"].as_u64().expect("t_ns")).collect::<Vec<_>>();
    assert!(times.windows(2).all(|w| w[0] <= w[1]));
}
