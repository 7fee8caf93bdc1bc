//! 可视化事件
//!
//! 网络层（入队、发送、丢包、送达）与 MPTCP 层（子流发送、映射、RTO、cwnd、状态迁移）
//! 的结构化事件，仿真结束后可整体写成一个 JSON 数组供离线回放。

mod types;

pub use types::{VizEvent, VizEventKind, VizLinkInfo, VizNodeInfo, VizNodeKind, VizLogger, VizPacketKind};
