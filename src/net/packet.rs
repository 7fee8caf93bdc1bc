//! 网络层 packet：预先算好的节点路径 + 传输层载荷

use super::id::NodeId;
use super::transport::Transport;

#[derive(Debug, Clone)]
pub struct Packet {
    pub id: u64,
    /// 发送方连接 id（viz 过滤用）
    pub flow_id: u64,
    /// 线上字节数（IP + TCP 头 + 载荷），决定序列化时间与队列占用
    pub size_bytes: u32,
    /// 含两端主机的节点路径
    pub route: Vec<NodeId>,
    /// 当前所在节点在 `route` 中的下标
    pub hop: usize,
    pub transport: Transport,
}

impl Packet {
    pub fn src(&self) -> NodeId {
        self.route[0]
    }

    /// 路径终点（空路径时返回一个不存在的节点）
    pub fn dst(&self) -> NodeId {
        self.route.last().copied().unwrap_or(NodeId(usize::MAX))
    }

    pub fn has_next(&self) -> bool {
        self.next().is_some()
    }

    pub fn next(&self) -> Option<NodeId> {
        self.route.get(self.hop + 1).copied()
    }

    /// 经过一条链路，到达下一跳
    pub fn advance(mut self) -> Self {
        self.hop += 1;
        self
    }
}
