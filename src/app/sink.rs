//! 接收应用

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::proto::mptcp::{Application, ConnId, Socket};
use crate::sim::SimTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// 每次 `recv` 调用最多读取的字节数
    pub read_size: usize,
    /// 保留收到的数据（用于逐字节校验）
    pub keep_data: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            read_size: 20,
            keep_data: true,
        }
    }
}

/// 接收方观测到的结果
#[derive(Debug, Clone, Default)]
pub struct SinkReport {
    pub accepted: Vec<ConnId>,
    pub bytes_received: u64,
    pub reads: u64,
    pub data: Vec<u8>,
    pub first_byte_at: Option<SimTime>,
    pub last_byte_at: Option<SimTime>,
    pub peer_closed_at: Option<SimTime>,
    pub closed_at: Option<SimTime>,
    pub reset: bool,
}

pub struct Sink {
    cfg: SinkConfig,
    report: Arc<Mutex<SinkReport>>,
}

impl Sink {
    pub fn new(cfg: SinkConfig, report: Arc<Mutex<SinkReport>>) -> Self {
        Self { cfg, report }
    }

    fn drain(&mut self, sock: &mut Socket<'_>) {
        let now = sock.now();
        let mut report = self.report.lock().expect("sink report lock");
        loop {
            match sock.recv(self.cfg.read_size) {
                Ok(d) if d.is_empty() => break,
                Ok(d) => {
                    report.reads += 1;
                    report.bytes_received += d.len() as u64;
                    report.first_byte_at.get_or_insert(now);
                    report.last_byte_at = Some(now);
                    if self.cfg.keep_data {
                        report.data.extend_from_slice(&d);
                    }
                }
                Err(e) => {
                    warn!(conn = sock.id(), error = %e, "读取失败");
                    break;
                }
            }
        }
    }
}

impl Application for Sink {
    fn on_accept(&mut self, listener: ConnId, sock: &mut Socket<'_>) {
        info!(listener, conn = sock.id(), "📥 接受连接");
        self.report
            .lock()
            .expect("sink report lock")
            .accepted
            .push(sock.id());
    }

    fn on_data_available(&mut self, sock: &mut Socket<'_>) {
        self.drain(sock);
    }

    fn on_peer_close(&mut self, sock: &mut Socket<'_>) {
        self.drain(sock);
        let now = sock.now();
        info!(conn = sock.id(), ?now, "对端关闭，关闭本端");
        self.report.lock().expect("sink report lock").peer_closed_at = Some(now);
        if let Err(e) = sock.close() {
            warn!(conn = sock.id(), error = %e, "关闭失败");
        }
    }

    fn on_closed(&mut self, sock: &mut Socket<'_>) {
        let now = sock.now();
        self.report.lock().expect("sink report lock").closed_at = Some(now);
    }

    fn on_reset(&mut self, sock: &mut Socket<'_>) {
        warn!(conn = sock.id(), "接收方连接被复位");
        self.report.lock().expect("sink report lock").reset = true;
    }
}
