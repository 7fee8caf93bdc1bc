//! 传输层/协议模块
//!
//! `tcp` 提供序列号、缓冲区与状态机；`mptcp` 在其上实现多路径 TCP。

pub mod mptcp;
pub mod tcp;
