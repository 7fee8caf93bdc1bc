//! 两条路径上的 MPTCP 批量传输
//!
//! client 从第一条路径发起连接，完全建立后在其余路径上加入子流；
//! server 端的 sink 按固定大小读取并逐字节校验。

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use mptcp_sim::app::{BulkSendConfig, SinkConfig, first_pattern_mismatch, setup_bulk_transfer};
use mptcp_sim::net::NetWorld;
use mptcp_sim::proto::mptcp::{CongestionControlKind, MptcpConfig, MptcpStack, SchedulerKind};
use mptcp_sim::sim::{SimTime, Simulator};
use mptcp_sim::topo::multipath::{MultipathOpts, PathSpec, build_multipath};
use mptcp_sim::viz::{VizEventKind, VizLogger};

#[derive(Debug, Parser)]
#[command(name = "mptcp-two-path", about = "多路径拓扑仿真：client->server 单连接 MPTCP 批量传输")]
struct Args {
    /// 要发送的应用数据量（字节）
    #[arg(long, default_value_t = 1_000_000)]
    bytes: u64,

    /// 每次写入的字节数
    #[arg(long, default_value_t = 100)]
    write_size: usize,

    /// 每次读取的字节数
    #[arg(long, default_value_t = 20)]
    read_size: usize,

    /// 每条路径的 RTT（毫秒），重复指定即多条路径
    #[arg(long = "path-rtt-ms", default_values_t = [10, 50])]
    path_rtt_ms: Vec<u64>,

    /// 每条链路带宽（Mbps）
    #[arg(long, default_value_t = 100)]
    bandwidth_mbps: u64,

    /// 路由器出口队列（单位：1500B 包）；0 表示几乎无限
    #[arg(long, default_value_t = 0)]
    queue_pkts: u64,

    /// 调度策略（覆盖配置文件）
    #[arg(long, value_enum)]
    scheduler: Option<SchedulerKind>,

    /// 拥塞控制（覆盖配置文件）
    #[arg(long, value_enum)]
    cc: Option<CongestionControlKind>,

    /// 只用第一条路径（不加入额外子流）
    #[arg(long, default_value_t = false)]
    single_path: bool,

    /// MptcpConfig 的 JSON 文件；不填则使用默认值
    #[arg(long)]
    config: Option<PathBuf>,

    /// 仿真运行到多少毫秒
    #[arg(long, default_value_t = 60_000)]
    until_ms: u64,

    /// 输出可视化 JSON 事件文件；不填则不生成
    #[arg(long)]
    viz_json: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .init();

    let args = Args::parse();

    let mut cfg: MptcpConfig = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path).expect("read config file");
            serde_json::from_str(&text).expect("parse config json")
        }
        None => MptcpConfig::default(),
    };
    if let Some(s) = args.scheduler {
        cfg.scheduler = s;
    }
    if let Some(cc) = args.cc {
        cfg.congestion_control = cc;
    }

    let mut sim = Simulator::default();
    let mut world = NetWorld::default();
    world.net.mptcp = MptcpStack::new(cfg);

    let queue_bytes = (args.queue_pkts > 0).then(|| mptcp_sim::queue::mem_from_pkt(args.queue_pkts));
    let opts = MultipathOpts {
        paths: args
            .path_rtt_ms
            .iter()
            .map(|&ms| PathSpec {
                rtt: SimTime::from_millis(ms),
                bandwidth_bps: args.bandwidth_mbps.saturating_mul(1_000_000),
                queue_bytes,
            })
            .collect(),
    };
    let topo = build_multipath(&mut world, &opts);

    // 统计每条子流的映射数需要事件记录，因此总是开启
    world.net.viz = Some(VizLogger::default());
    world.net.emit_viz_meta();

    let bulk = BulkSendConfig {
        total_bytes: args.bytes,
        write_size: args.write_size,
        ..BulkSendConfig::default()
    };
    // 额外路径按拓扑自动填充；单路径时只把第一条路径交给应用
    let mut topo_for_setup = topo.clone();
    if args.single_path {
        topo_for_setup.routers.truncate(1);
    }
    let sink = SinkConfig {
        read_size: args.read_size,
        keep_data: true,
    };
    let xfer = setup_bulk_transfer(&mut world, &mut sim, &topo_for_setup, bulk, sink, 5000, SimTime::ZERO)
        .expect("set up bulk transfer");

    sim.run_until(SimTime::from_millis(args.until_ms), &mut world);

    let mut mappings: BTreeMap<usize, u64> = BTreeMap::new();
    let mut retrans = 0u64;
    if let Some(v) = &world.net.viz {
        for ev in &v.events {
            match &ev.kind {
                VizEventKind::MappingAdded { conn, subflow, .. } if *conn == xfer.client => {
                    *mappings.entry(*subflow).or_default() += 1;
                }
                VizEventKind::SubflowSend { retrans: true, .. } => retrans += 1,
                _ => {}
            }
        }
    }

    if let Some(path) = args.viz_json {
        if let Some(v) = world.net.viz.take() {
            let json = serde_json::to_string_pretty(&v.events).expect("serialize viz events");
            fs::write(&path, json).expect("write viz json");
            eprintln!("wrote viz events to {}", path.display());
        }
    }

    // 每条路径上客户端出口的最大排队量
    let peak_queue_bytes: Vec<u64> = topo
        .routers
        .iter()
        .map(|&r| world.net.queue_peak_bytes(topo.client, r).unwrap_or(0))
        .collect();

    let sender = xfer.sender.lock().expect("sender report lock").clone();
    let sink = xfer.sink.lock().expect("sink report lock").clone();
    let data_ok = sink.bytes_received == args.bytes && first_pattern_mismatch(&sink.data).is_none();
    let fct = match (sender.connected_at, sink.last_byte_at) {
        (Some(s), Some(e)) if e >= s => Some(e.saturating_sub(s)),
        _ => None,
    };
    let goodput_mbps = fct.map(|d| {
        let secs = d.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            sink.bytes_received as f64 * 8.0 / secs / 1e6
        }
    });

    println!(
        "done @ {:?}\n  mptcp: bytes_written={}, bytes_received={}, data_ok={}, subflows={}, mappings={:?}, retrans={}, closed={}, fct={:?}, goodput_mbps={:?}\n  net: delivered_pkts={}, delivered_bytes={}, dropped_pkts={}, dropped_bytes={}, peak_queue_bytes={:?}",
        sim.now(),
        sender.bytes_written,
        sink.bytes_received,
        data_ok,
        sender.subflows_connected.len(),
        mappings,
        retrans,
        sender.closed_at.is_some() && sink.closed_at.is_some(),
        fct,
        goodput_mbps,
        world.net.stats.delivered_pkts,
        world.net.stats.delivered_bytes,
        world.net.stats.dropped_pkts,
        world.net.stats.dropped_bytes,
        peak_queue_bytes
    );
}
