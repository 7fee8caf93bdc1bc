//! 批量发送应用

use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::proto::mptcp::{Application, ConnId, Socket, SubflowId};
use crate::sim::SimTime;

use super::pattern_byte;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkSendConfig {
    /// 总共要写入的字节数
    pub total_bytes: u64,
    /// 每次 `send` 调用最多写入的字节数
    pub write_size: usize,
    /// 完全建立后要加入的 (本地, 远端) 地址对
    pub extra_paths: Vec<(SocketAddrV4, SocketAddrV4)>,
    /// 全部写完后关闭连接
    pub close_when_done: bool,
}

impl Default for BulkSendConfig {
    fn default() -> Self {
        Self {
            total_bytes: 1_000_000,
            write_size: 100,
            extra_paths: Vec::new(),
            close_when_done: true,
        }
    }
}

/// 发送方观测到的结果
#[derive(Debug, Clone, Default)]
pub struct BulkSendReport {
    pub conn: Option<ConnId>,
    pub bytes_written: u64,
    pub writes: u64,
    pub connected_at: Option<SimTime>,
    pub fully_established_at: Option<SimTime>,
    pub all_written_at: Option<SimTime>,
    pub closed_at: Option<SimTime>,
    /// 握手完成的子流（含主子流）
    pub subflows_connected: Vec<SubflowId>,
    pub join_errors: Vec<String>,
    pub connect_failed: bool,
    pub reset: bool,
}

pub struct BulkSend {
    cfg: BulkSendConfig,
    written: u64,
    closing: bool,
    report: Arc<Mutex<BulkSendReport>>,
}

impl BulkSend {
    pub fn new(cfg: BulkSendConfig, report: Arc<Mutex<BulkSendReport>>) -> Self {
        Self {
            cfg,
            written: 0,
            closing: false,
            report,
        }
    }

    fn with_report(&self, f: impl FnOnce(&mut BulkSendReport)) {
        let mut r = self.report.lock().expect("bulk send report lock");
        f(&mut r);
    }

    /// 在发送缓冲区允许的范围内尽量写
    fn fill(&mut self, sock: &mut Socket<'_>) {
        let mut writes = 0u64;
        while self.written < self.cfg.total_bytes {
            let space = sock.send_space();
            if space == 0 {
                break;
            }
            let chunk = (self.cfg.total_bytes - self.written)
                .min(self.cfg.write_size as u64)
                .min(space as u64);
            let data: Vec<u8> = (self.written..self.written + chunk).map(pattern_byte).collect();
            match sock.send(&data) {
                Ok(0) => break,
                Ok(n) => {
                    self.written += n as u64;
                    writes += 1;
                }
                Err(e) => {
                    warn!(conn = sock.id(), error = %e, "写入失败");
                    break;
                }
            }
        }
        let (written, now) = (self.written, sock.now());
        let done = written == self.cfg.total_bytes;
        self.with_report(|r| {
            r.bytes_written = written;
            r.writes += writes;
            if done && r.all_written_at.is_none() {
                r.all_written_at = Some(now);
            }
        });
        if done && self.cfg.close_when_done && !self.closing {
            self.closing = true;
            info!(conn = sock.id(), bytes = written, "全部写入，关闭连接");
            if let Err(e) = sock.close() {
                warn!(conn = sock.id(), error = %e, "关闭失败");
            }
        }
    }
}

impl Application for BulkSend {
    fn on_connected(&mut self, sock: &mut Socket<'_>) {
        let (conn, now) = (sock.id(), sock.now());
        info!(conn, ?now, "🤝 连接建立，开始发送");
        self.with_report(|r| {
            r.conn = Some(conn);
            r.connected_at = Some(now);
        });
        self.fill(sock);
    }

    fn on_connect_failed(&mut self, sock: &mut Socket<'_>) {
        warn!(conn = sock.id(), "连接失败");
        self.with_report(|r| r.connect_failed = true);
    }

    fn on_send_possible(&mut self, sock: &mut Socket<'_>, _space: usize) {
        self.fill(sock);
    }

    fn on_subflow_connected(&mut self, sock: &mut Socket<'_>, subflow: SubflowId) {
        debug!(conn = sock.id(), subflow, "子流建立");
        self.with_report(|r| r.subflows_connected.push(subflow));
    }

    fn on_fully_established(&mut self, sock: &mut Socket<'_>) {
        let now = sock.now();
        self.with_report(|r| r.fully_established_at = Some(now));
        for (local, remote) in self.cfg.extra_paths.clone() {
            match sock.connect_new_subflow(local, remote) {
                Ok(id) => info!(conn = sock.id(), subflow = id, %local, %remote, "➕ 加入新路径"),
                Err(e) => {
                    warn!(conn = sock.id(), %local, %remote, error = %e, "加入新路径失败");
                    self.with_report(|r| r.join_errors.push(e.to_string()));
                }
            }
        }
    }

    fn on_closed(&mut self, sock: &mut Socket<'_>) {
        let now = sock.now();
        info!(conn = sock.id(), ?now, "发送方连接关闭");
        self.with_report(|r| r.closed_at = Some(now));
    }

    fn on_reset(&mut self, sock: &mut Socket<'_>) {
        warn!(conn = sock.id(), "发送方连接被复位");
        self.with_report(|r| r.reset = true);
    }
}
