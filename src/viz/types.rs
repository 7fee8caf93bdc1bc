use serde::{Deserialize, Serialize};

use crate::proto::tcp::TcpState;

/// 可视化事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VizEventKind {
    /// 仿真/拓扑元信息（建议作为 t=0 的第一条事件）
    Meta {
        nodes: Vec<VizNodeInfo>,
        links: Vec<VizLinkInfo>,
    },
    /// 节点开始处理一个到达的数据包（可用于区分 host/switch）
    NodeRx {
        node: usize,
        node_kind: VizNodeKind,
        node_name: String,
    },
    /// 节点决定把包转发到下一跳（发生在入队之前）
    NodeForward { node: usize, next: usize },
    /// packet 入队（发生在某条单向链路的队列上）
    Enqueue {
        link_from: usize,
        link_to: usize,
        q_bytes: u64,
        q_cap_bytes: u64,
    },
    /// packet 出队并开始发送（链路序列化开始）
    TxStart {
        link_from: usize,
        link_to: usize,
        depart_ns: u64,
        arrive_ns: u64,
    },
    /// packet 在某节点“到达事件”触发（DeliverPacket）
    ArriveNode { node: usize },
    /// packet 在目的节点被标记为 delivered（统计+上层处理）
    Delivered { node: usize },
    /// DropTail 丢包
    Drop {
        link_from: usize,
        link_to: usize,
        q_bytes: u64,
        q_cap_bytes: u64,
    },
    /// 子流发送数据段（`dsn` 为段首字节的数据序列号）
    SubflowSend {
        conn: u64,
        subflow: usize,
        ssn: u32,
        len: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        dsn: Option<u64>,
        retrans: bool,
    },
    /// 子流登记了新的 DSN→SSN 发送映射
    MappingAdded {
        conn: u64,
        subflow: usize,
        dsn: u64,
        ssn: u32,
        len: u16,
    },
    /// 子流 RTO 超时
    SubflowRto { conn: u64, subflow: usize, ssn: u32 },
    /// 子流 cwnd 采样
    SubflowCwnd {
        conn: u64,
        subflow: usize,
        cwnd: u64,
        ssthresh: u64,
    },
    SubflowState {
        conn: u64,
        subflow: usize,
        old: TcpState,
        new: TcpState,
    },
    /// meta 连接状态迁移
    MetaState {
        conn: u64,
        old: TcpState,
        new: TcpState,
    },
}

/// packet 的类别（便于可视化上色）
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VizPacketKind {
    Data,
    Ack,
    Other,
}

/// 节点类型（用于可视化区分 host/switch）
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VizNodeKind {
    Host,
    Switch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VizNodeInfo {
    pub id: usize,
    pub name: String,
    pub kind: VizNodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VizLinkInfo {
    pub from: usize,
    pub to: usize,
    /// 单向链路带宽（bps）
    pub bandwidth_bps: u64,
    /// 单向传播时延（ns）
    pub latency_ns: u64,
    /// 队列容量（bytes）
    pub q_cap_bytes: u64,
}

/// 一个可回放的事件（JSON）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VizEvent {
    /// 仿真时间（纳秒，和 `SimTime.0` 同口径）
    pub t_ns: u64,
    pub pkt_id: Option<u64>,
    pub flow_id: Option<u64>,
    pub pkt_bytes: Option<u32>,
    pub pkt_kind: Option<VizPacketKind>,
    #[serde(flatten)]
    pub kind: VizEventKind,
}

/// 一个简单的事件收集器（存内存，仿真结束写 JSON 文件）
#[derive(Debug, Default)]
pub struct VizLogger {
    pub events: Vec<VizEvent>,
}

impl VizLogger {
    pub fn push(&mut self, ev: VizEvent) {
        self.events.push(ev);
    }
}
