//! 子流：一条 TCP 连接
//!
//! 子流拥有自己的序列号空间、RTT 估计器、拥塞窗口以及收发两个映射容器。
//! 它不直接修改 meta 连接的状态：收到的信令以 [`SubflowEvent`] 的形式
//! 排队，由 meta 连接在处理完一个段后统一取走。

use std::net::SocketAddrV4;

use tracing::{debug, info, trace, warn};

use crate::proto::tcp::{
    SeqNum, SequenceSpace, TcpConfig, TcpCore, TcpFlags, TcpHeader, TcpSegment, TcpState,
    RttEstimator,
};
use crate::sim::{EventId, SimTime};
use crate::viz::VizEventKind;

use super::crypto::{join_hmac, truncate_hmac};
use super::error::{MptcpError, Result, invariant_violation};
use super::io::{Io, TimerKey, TimerKind};
use super::lia::{CcInput, increase_window};
use super::mapping::{Mapping, MappingContainer};
use super::options::{Dss, DssMapping, Join, MptcpOption, parse_options};
use super::scheduler::SubflowStatus;
use super::{ConnId, SubflowId};

const DUP_ACK_THRESHOLD: u32 = 3;

/// 子流角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubflowRole {
    /// 以 MP_CAPABLE 建立的第一个子流
    Master,
    /// 以 MP_JOIN 加入的子流
    Join,
}

/// 握手所需的密钥材料
#[derive(Debug, Clone)]
enum Handshake {
    Capable {
        local_key: u64,
        peer_key: Option<u64>,
    },
    Join {
        local_key: u64,
        peer_key: u64,
        peer_token: u32,
        local_nonce: u32,
        peer_nonce: Option<u32>,
        backup: bool,
    },
}

/// meta 连接在每次调用子流前给出的连接级上下文
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnCtx {
    /// 要携带的 DATA_ACK（对端 IDSN 未知时为 `None`）
    pub data_ack: Option<u64>,
    /// 通告给对端的连接级接收窗口
    pub rcv_window: u32,
    pub cc: CcInput,
}

/// 子流交给 meta 连接处理的通知
#[derive(Debug, Clone, PartialEq)]
pub enum SubflowEvent {
    StateChanged { old: TcpState, new: TcpState },
    /// 握手中得知对端密钥（MP_CAPABLE）
    PeerKey(u64),
    /// 收到 DSS；`window` 为同一段通告的接收窗口
    Dss { dss: Dss, window: u32 },
    /// 子流接收缓冲区有新的按序字节
    DataReceived,
    NewCwnd(u64),
    AddAddr { addr_id: u8, addr: SocketAddrV4 },
    RemoveAddr(Vec<u8>),
    /// 收到 RST 或本端因对端协议错误而复位
    Reset,
    /// 主动打开失败（SYN 重传耗尽或被 RST）
    ConnectFailed,
}

#[derive(Debug, Default)]
struct Timers {
    rto: Option<EventId>,
    delack: Option<EventId>,
    time_wait: Option<EventId>,
}

/// 创建子流的公共参数
#[derive(Debug, Clone)]
pub struct SubflowParams {
    pub conn: ConnId,
    pub id: SubflowId,
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub local_id: u8,
    pub iss: SeqNum,
    pub tcp: TcpConfig,
    pub tx_capacity: usize,
    pub rx_capacity: usize,
}

#[derive(Debug)]
pub struct Subflow {
    conn: ConnId,
    id: SubflowId,
    role: SubflowRole,
    /// 主动打开的一端
    active: bool,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    local_id: u8,
    remote_id: Option<u8>,
    handshake: Handshake,
    cfg: TcpConfig,

    pub(crate) core: TcpCore<SeqNum>,
    iss: SeqNum,

    cwnd: u64,
    ssthresh: u64,
    dup_acks: u32,
    /// NewReno 快速恢复的退出点
    recover: Option<SeqNum>,
    rtt: RttEstimator,
    owd: Option<SimTime>,
    retries: u32,

    tx_mappings: MappingContainer,
    rx_mappings: MappingContainer,

    timers: Timers,
    delack_count: u32,
    ack_now: bool,
    ack_pending: bool,
    ts_recent: u32,
    last_adv_window: u32,
    /// 对端最近通告的接收窗口
    peer_window: u32,

    join_confirmed: bool,
    fin_queued: bool,
    fin_seq: Option<SeqNum>,
    fin_acked: bool,
    fin_received: bool,

    /// 等待随下一个段发出的信令（ADD_ADDR / REMOVE_ADDR）
    pending_signals: Vec<MptcpOption>,
    events: Vec<SubflowEvent>,
}

impl Subflow {
    fn new(p: SubflowParams, role: SubflowRole, active: bool, handshake: Handshake) -> Self {
        let data_start = p.iss.wrapping_add(1);
        let rtt = RttEstimator::new(p.tcp.init_rto, p.tcp.min_rto, p.tcp.max_rto);
        let cwnd = p.tcp.init_cwnd_bytes().max(p.tcp.mss as u64);
        let ssthresh = p.tcp.init_ssthresh_bytes.max(2 * p.tcp.mss as u64);
        Self {
            conn: p.conn,
            id: p.id,
            role,
            active,
            local: p.local,
            remote: p.remote,
            local_id: p.local_id,
            remote_id: None,
            handshake,
            core: TcpCore::new(p.iss, data_start, SeqNum(0), p.tx_capacity, p.rx_capacity),
            iss: p.iss,
            cwnd,
            ssthresh,
            dup_acks: 0,
            recover: None,
            rtt,
            owd: None,
            retries: 0,
            tx_mappings: MappingContainer::new(),
            rx_mappings: MappingContainer::new(),
            timers: Timers::default(),
            delack_count: 0,
            ack_now: false,
            ack_pending: false,
            ts_recent: 0,
            last_adv_window: 0,
            peer_window: 0,
            join_confirmed: role == SubflowRole::Master,
            fin_queued: false,
            fin_seq: None,
            fin_acked: false,
            fin_received: false,
            pending_signals: Vec::new(),
            events: Vec::new(),
            cfg: p.tcp,
        }
    }

    /// 主动打开的 master 子流（MP_CAPABLE）
    pub fn new_master_active(p: SubflowParams, local_key: u64) -> Self {
        Self::new(
            p,
            SubflowRole::Master,
            true,
            Handshake::Capable {
                local_key,
                peer_key: None,
            },
        )
    }

    /// 主动发起的 MP_JOIN 子流
    pub fn new_join_active(
        p: SubflowParams,
        local_key: u64,
        peer_key: u64,
        peer_token: u32,
        local_nonce: u32,
        backup: bool,
    ) -> Self {
        Self::new(
            p,
            SubflowRole::Join,
            true,
            Handshake::Join {
                local_key,
                peer_key,
                peer_token,
                local_nonce,
                peer_nonce: None,
                backup,
            },
        )
    }

    /// 被动打开的 master 子流；`syn_seq` 为对端 SYN 的序号
    pub fn new_master_passive(p: SubflowParams, local_key: u64, peer_key: u64, syn_seq: SeqNum) -> Self {
        let mut sf = Self::new(
            p,
            SubflowRole::Master,
            false,
            Handshake::Capable {
                local_key,
                peer_key: Some(peer_key),
            },
        );
        sf.core.rx.reset(syn_seq.wrapping_add(1));
        sf
    }

    /// 被动接受的 MP_JOIN 子流
    #[allow(clippy::too_many_arguments)]
    pub fn new_join_passive(
        p: SubflowParams,
        local_key: u64,
        peer_key: u64,
        local_nonce: u32,
        peer_nonce: u32,
        remote_id: u8,
        backup: bool,
        syn_seq: SeqNum,
    ) -> Self {
        let mut sf = Self::new(
            p,
            SubflowRole::Join,
            false,
            Handshake::Join {
                local_key,
                peer_key,
                peer_token: 0,
                local_nonce,
                peer_nonce: Some(peer_nonce),
                backup,
            },
        );
        sf.remote_id = Some(remote_id);
        sf.join_confirmed = true;
        sf.core.rx.reset(syn_seq.wrapping_add(1));
        sf
    }

    pub fn id(&self) -> SubflowId {
        self.id
    }

    pub fn role(&self) -> SubflowRole {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == SubflowRole::Master
    }

    pub fn state(&self) -> TcpState {
        self.core.state
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.remote
    }

    pub fn local_id(&self) -> u8 {
        self.local_id
    }

    pub fn remote_id(&self) -> Option<u8> {
        self.remote_id
    }

    pub fn cwnd(&self) -> u64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u64 {
        self.ssthresh
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn owd(&self) -> Option<SimTime> {
        self.owd
    }

    pub fn tx_mappings(&self) -> &MappingContainer {
        &self.tx_mappings
    }

    pub fn rx_mappings(&self) -> &MappingContainer {
        &self.rx_mappings
    }

    /// 拥塞避免阶段（LIA 只在此阶段耦合）
    pub fn in_congestion_avoidance(&self) -> bool {
        self.cwnd >= self.ssthresh
    }

    /// 对端接收窗口之外、本子流可新映射的字节数
    pub fn available_window(&self) -> u64 {
        if !self.can_send_data() {
            return 0;
        }
        let outstanding = self.core.first_unacked.distance_to(self.core.tx.tail()) as u64;
        self.cwnd
            .saturating_sub(outstanding)
            .min(self.core.tx.free() as u64)
    }

    /// 可以承载新的连接级数据
    pub fn can_send_data(&self) -> bool {
        self.core.state.can_send() && !self.fin_queued && self.join_confirmed
    }

    pub fn status(&self) -> SubflowStatus {
        SubflowStatus {
            id: self.id,
            rtt: self.rtt.estimate(),
            owd: self.owd,
            available_window: self.available_window(),
        }
    }

    /// 子流接收缓冲区中尚未交给 meta 的字节数
    pub fn rx_buffered(&self) -> usize {
        self.core.rx.buffered()
    }

    pub fn drain_events(&mut self) -> Vec<SubflowEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn peer_window(&self) -> u32 {
        self.peer_window
    }

    /// 接收缓冲区下一个待取出字节对应的 DSN
    pub fn next_rx_dsn(&self) -> Option<u64> {
        let head = self.core.rx.head();
        self.rx_mappings
            .iter()
            .find(|m| m.covers_ssn(head))
            .and_then(|m| m.dsn_for_ssn(head))
    }

    fn now_us(io: &dyn Io) -> u32 {
        io.now().as_micros() as u32
    }

    fn timer_key(&self, kind: TimerKind) -> TimerKey {
        TimerKey {
            conn: self.conn,
            subflow: Some(self.id),
            kind,
        }
    }

    fn set_state(&mut self, new: TcpState, io: &mut dyn Io) {
        let old = self.core.set_state(new);
        if old == new {
            return;
        }
        info!(conn = self.conn, subflow = self.id, %old, %new, "🔁 子流状态变化");
        io.viz(
            self.conn,
            VizEventKind::SubflowState {
                conn: self.conn,
                subflow: self.id,
                old,
                new,
            },
        );
        match new {
            TcpState::TimeWait => {
                self.cancel_timer(TimerKind::Retransmit, io);
                let id = io.schedule(self.cfg.time_wait, self.timer_key(TimerKind::TimeWait));
                self.timers.time_wait = Some(id);
            }
            TcpState::Closed => self.cancel_all_timers(io),
            _ => {}
        }
        self.events.push(SubflowEvent::StateChanged { old, new });
    }

    fn arm_rto(&mut self, io: &mut dyn Io) {
        self.cancel_timer(TimerKind::Retransmit, io);
        let id = io.schedule(self.rtt.rto(), self.timer_key(TimerKind::Retransmit));
        self.timers.rto = Some(id);
    }

    fn cancel_timer(&mut self, kind: TimerKind, io: &mut dyn Io) {
        let slot = match kind {
            TimerKind::Retransmit => &mut self.timers.rto,
            TimerKind::DelayedAck => &mut self.timers.delack,
            TimerKind::TimeWait => &mut self.timers.time_wait,
            TimerKind::Persist | TimerKind::DataFinRetransmit => return,
        };
        if let Some(id) = slot.take() {
            io.cancel(id);
        }
    }

    fn cancel_all_timers(&mut self, io: &mut dyn Io) {
        self.cancel_timer(TimerKind::Retransmit, io);
        self.cancel_timer(TimerKind::DelayedAck, io);
        self.cancel_timer(TimerKind::TimeWait, io);
    }

    /// 下一个要确认的对端序号（FIN 占一个序号）
    fn rcv_ack(&self) -> SeqNum {
        self.core.rx.next().advance(usize::from(self.fin_received))
    }

    // ---------------------------------------------------------------
    // 发送
    // ---------------------------------------------------------------

    fn transmit(
        &mut self,
        mut flags: TcpFlags,
        seq: SeqNum,
        payload: Vec<u8>,
        options: Vec<MptcpOption>,
        ctx: &ConnCtx,
        io: &mut dyn Io,
    ) {
        let synchronized_rx = self.core.state != TcpState::SynSent;
        if synchronized_rx && !flags.rst() {
            flags = flags | TcpFlags::ACK;
        }
        let ack = if flags.ack() { self.rcv_ack() } else { SeqNum(0) };
        let window = ctx.rcv_window.min(self.core.rx.free() as u32);
        let mut h = TcpHeader::new(self.local, self.remote, flags, seq, ack, window);
        h.set_timestamp(Self::now_us(io), self.ts_recent);
        for opt in options.iter().chain(self.pending_signals.iter()) {
            opt.attach(&mut h);
        }
        self.pending_signals.clear();
        trace!(
            conn = self.conn,
            subflow = self.id,
            flags = %h.flags,
            seq = %seq,
            ack = %ack,
            len = payload.len(),
            "子流发送段"
        );
        io.send(self.conn, TcpSegment::new(h, payload));
        if flags.ack() {
            self.last_adv_window = window;
            self.ack_now = false;
            self.ack_pending = false;
            self.delack_count = 0;
            self.cancel_timer(TimerKind::DelayedAck, io);
        }
    }

    fn handshake_option(&self, stage: HandshakeStage) -> Option<MptcpOption> {
        match (&self.handshake, stage) {
            (Handshake::Capable { local_key, .. }, HandshakeStage::Syn | HandshakeStage::SynAck) => {
                Some(MptcpOption::Capable {
                    sender_key: *local_key,
                    receiver_key: None,
                })
            }
            (
                Handshake::Capable {
                    local_key,
                    peer_key,
                },
                HandshakeStage::Ack,
            ) => Some(MptcpOption::Capable {
                sender_key: *local_key,
                receiver_key: *peer_key,
            }),
            (
                Handshake::Join {
                    peer_token,
                    local_nonce,
                    backup,
                    ..
                },
                HandshakeStage::Syn,
            ) => Some(MptcpOption::Join(Join::Syn {
                token: *peer_token,
                nonce: *local_nonce,
                addr_id: self.local_id,
                backup: *backup,
            })),
            (
                Handshake::Join {
                    local_key,
                    peer_key,
                    local_nonce,
                    peer_nonce: Some(peer_nonce),
                    backup,
                    ..
                },
                HandshakeStage::SynAck,
            ) => Some(MptcpOption::Join(Join::SynAck {
                truncated_hmac: truncate_hmac(&join_hmac(
                    *local_key,
                    *peer_key,
                    *local_nonce,
                    *peer_nonce,
                )),
                nonce: *local_nonce,
                addr_id: self.local_id,
                backup: *backup,
            })),
            (
                Handshake::Join {
                    local_key,
                    peer_key,
                    local_nonce,
                    peer_nonce: Some(peer_nonce),
                    ..
                },
                HandshakeStage::Ack,
            ) => Some(MptcpOption::Join(Join::Ack {
                hmac: join_hmac(*local_key, *peer_key, *local_nonce, *peer_nonce),
            })),
            _ => None,
        }
    }

    fn send_syn(&mut self, ctx: &ConnCtx, io: &mut dyn Io) {
        let opts = self.handshake_option(HandshakeStage::Syn).into_iter().collect();
        self.transmit(TcpFlags::SYN, self.iss, Vec::new(), opts, ctx, io);
    }

    fn send_syn_ack(&mut self, ctx: &ConnCtx, io: &mut dyn Io) {
        let opts = self.handshake_option(HandshakeStage::SynAck).into_iter().collect();
        self.transmit(TcpFlags::SYN | TcpFlags::ACK, self.iss, Vec::new(), opts, ctx, io);
    }

    /// 第三个 ACK（MP_CAPABLE 双方密钥或 MP_JOIN 完整 HMAC）
    fn send_handshake_ack(&mut self, ctx: &ConnCtx, io: &mut dyn Io) {
        let opts = self.handshake_option(HandshakeStage::Ack).into_iter().collect();
        let seq = self.core.next_tx;
        self.transmit(TcpFlags::ACK, seq, Vec::new(), opts, ctx, io);
    }

    fn dss_for(&self, ctx: &ConnCtx, mapping: Option<DssMapping>) -> Option<MptcpOption> {
        if ctx.data_ack.is_none() && mapping.is_none() {
            return None;
        }
        Some(MptcpOption::Dss(Dss {
            data_ack: ctx.data_ack,
            mapping,
        }))
    }

    fn send_data_segment(
        &mut self,
        seq: SeqNum,
        payload: Vec<u8>,
        m: &Mapping,
        retrans: bool,
        ctx: &ConnCtx,
        io: &mut dyn Io,
    ) {
        let dss = DssMapping {
            dsn: m.head_dsn(),
            ssn: m.head_ssn().0,
            data_len: m.len(),
            data_fin: false,
        };
        let len = payload.len() as u32;
        let dsn = m.dsn_for_ssn(seq);
        io.viz(
            self.conn,
            VizEventKind::SubflowSend {
                conn: self.conn,
                subflow: self.id,
                ssn: seq.0,
                len,
                dsn,
                retrans,
            },
        );
        let opts = self.dss_for(ctx, Some(dss)).into_iter().collect();
        self.transmit(TcpFlags::PSH, seq, payload, opts, ctx, io);
        if self.timers.rto.is_none() {
            self.arm_rto(io);
        }
    }

    fn send_fin(&mut self, ctx: &ConnCtx, io: &mut dyn Io) {
        let seq = self.core.tx.tail();
        let first = self.fin_seq.is_none();
        self.fin_seq = Some(seq);
        let opts = self.dss_for(ctx, None).into_iter().collect();
        debug!(conn = self.conn, subflow = self.id, seq = %seq, "子流发送 FIN");
        self.transmit(TcpFlags::FIN, seq, Vec::new(), opts, ctx, io);
        self.core.record_sent(seq.advance(1));
        if self.timers.rto.is_none() {
            self.arm_rto(io);
        }
        if first {
            if let Some(next) = self.core.state.on_close() {
                self.set_state(next, io);
            }
        }
    }

    /// 纯 ACK，携带 DATA_ACK
    pub fn send_ack(&mut self, ctx: &ConnCtx, io: &mut dyn Io) {
        if !self.core.state.is_synchronized() && self.core.state != TcpState::SynRcvd {
            return;
        }
        let opts = self.dss_for(ctx, None).into_iter().collect();
        let seq = self.core.next_tx;
        self.transmit(TcpFlags::ACK, seq, Vec::new(), opts, ctx, io);
    }

    /// 在一个 ACK 上携带纯 DATA_FIN（不占子流序号）
    pub fn send_data_fin(&mut self, dsn: u64, ctx: &ConnCtx, io: &mut dyn Io) {
        let m = DssMapping {
            dsn,
            ssn: 0,
            data_len: 1,
            data_fin: true,
        };
        debug!(conn = self.conn, subflow = self.id, dsn, "发送 DATA_FIN");
        let opts = self.dss_for(ctx, Some(m)).into_iter().collect();
        let seq = self.core.next_tx;
        self.transmit(TcpFlags::ACK, seq, Vec::new(), opts, ctx, io);
    }

    /// 排队一个随下一个段发出的信令选项
    pub fn queue_signal(&mut self, opt: MptcpOption) {
        self.pending_signals.push(opt);
        self.ack_now = true;
    }

    /// 主动打开：发送 SYN
    pub fn connect(&mut self, ctx: &ConnCtx, io: &mut dyn Io) {
        self.set_state(TcpState::SynSent, io);
        self.send_syn(ctx, io);
        self.core.record_sent(self.iss.wrapping_add(1));
        self.arm_rto(io);
    }

    /// 被动打开：回复 SYN/ACK
    pub fn accept(&mut self, syn: &TcpSegment, ctx: &ConnCtx, io: &mut dyn Io) {
        if let Some((val, _)) = syn.header.timestamp() {
            self.ts_recent = val;
        }
        self.set_state(TcpState::SynRcvd, io);
        self.send_syn_ack(ctx, io);
        self.core.record_sent(self.iss.wrapping_add(1));
        self.arm_rto(io);
    }

    /// 把 `bytes`（DSN 从 `dsn` 起）追加到发送缓冲区尾部，并在第一个未映射 SSN 上登记映射
    pub fn add_loose_mapping(&mut self, dsn: u64, bytes: &[u8], io: &mut dyn Io) -> Result<Mapping> {
        let len = u16::try_from(bytes.len())
            .map_err(|_| invariant_violation("mapping longer than 65535 bytes"))?;
        let tail = self.core.tx.tail();
        let ssn = self.tx_mappings.first_unmapped_ssn(tail);
        if ssn != tail {
            return Err(invariant_violation(format!(
                "subflow {} has unmapped bytes before SSN {ssn}",
                self.id
            )));
        }
        if self.core.tx.append(bytes) != bytes.len() {
            return Err(invariant_violation(format!(
                "subflow {} send buffer overflow",
                self.id
            )));
        }
        let m = Mapping::new(dsn, ssn, len);
        if !self.tx_mappings.add_mapping(m) {
            return Err(invariant_violation(format!("overlapping send mapping {m}")));
        }
        trace!(conn = self.conn, subflow = self.id, mapping = %m, "登记发送映射");
        io.viz(
            self.conn,
            VizEventKind::MappingAdded {
                conn: self.conn,
                subflow: self.id,
                dsn,
                ssn: ssn.0,
                len,
            },
        );
        Ok(m)
    }

    /// 在窗口允许时发送已映射未发送的数据；全部发完且已请求关闭时发送 FIN
    pub fn send_pending(&mut self, ctx: &ConnCtx, io: &mut dyn Io) -> Result<()> {
        if !self.core.state.is_synchronized() || !self.join_confirmed {
            return Ok(());
        }
        loop {
            let next = self.core.next_tx;
            let tail = self.core.tx.tail();
            if !next.before(tail) {
                break;
            }
            let in_flight = self.core.in_flight() as u64;
            if in_flight >= self.cwnd {
                break;
            }
            let m = self.tx_mappings.get_mapping_for_ssn(next).ok_or_else(|| {
                invariant_violation(format!(
                    "subflow {} has queued SSN {next} without mapping",
                    self.id
                ))
            })?;
            let len = (self.cfg.mss as u64)
                .min(self.cwnd - in_flight)
                .min(next.distance_to(m.tail_ssn().advance(1)) as u64)
                .min(next.distance_to(tail) as u64) as usize;
            if len == 0 {
                break;
            }
            let retrans = next.before(self.core.high_tx_mark);
            let payload = self.core.tx.copy_range(next, len);
            self.send_data_segment(next, payload, &m, retrans, ctx, io);
            self.core.record_sent(next.advance(len));
        }
        let fin_due = match self.fin_seq {
            None => true,
            Some(f) => self.core.next_tx == f,
        };
        if self.fin_queued && fin_due && self.core.next_tx == self.core.tx.tail() {
            self.send_fin(ctx, io);
        }
        Ok(())
    }

    /// 若有待发送的 ACK 则发送；否则按需启动延迟 ACK 定时器
    pub fn flush_ack(&mut self, ctx: &ConnCtx, io: &mut dyn Io) {
        if !self.core.state.is_synchronized() {
            return;
        }
        if self.ack_now || !self.pending_signals.is_empty() {
            self.send_ack(ctx, io);
        } else if self.ack_pending && self.timers.delack.is_none() {
            let id = io.schedule(
                self.cfg.delayed_ack_timeout,
                self.timer_key(TimerKind::DelayedAck),
            );
            self.timers.delack = Some(id);
        }
    }

    /// 请求立即发送 ACK（窗口更新等）
    pub fn request_ack(&mut self) {
        self.ack_now = true;
    }

    pub fn last_advertised_window(&self) -> u32 {
        self.last_adv_window
    }

    /// 重传 `first_unacked` 处的一个段，不跨越映射边界。返回占用的序号数。
    fn retransmit_head(&mut self, ctx: &ConnCtx, io: &mut dyn Io) -> Result<usize> {
        let seq = self.core.first_unacked;
        if self.fin_seq == Some(seq) {
            let opts = self.dss_for(ctx, None).into_iter().collect();
            self.transmit(TcpFlags::FIN, seq, Vec::new(), opts, ctx, io);
            return Ok(1);
        }
        let m = self.tx_mappings.get_mapping_for_ssn(seq).ok_or_else(|| {
            invariant_violation(format!(
                "subflow {} retransmit: no mapping covers SSN {seq}",
                self.id
            ))
        })?;
        let len = (self.cfg.mss as usize)
            .min(seq.distance_to(m.tail_ssn().advance(1)))
            .min(seq.distance_to(self.core.tx.tail()));
        if len == 0 {
            return Ok(0);
        }
        debug!(conn = self.conn, subflow = self.id, seq = %seq, len, mapping = %m, "🔁 重传");
        let payload = self.core.tx.copy_range(seq, len);
        self.send_data_segment(seq, payload, &m, true, ctx, io);
        Ok(len)
    }

    /// 本端关闭子流：数据发完后发送 FIN
    pub fn close(&mut self, ctx: &ConnCtx, io: &mut dyn Io) -> Result<()> {
        match self.core.state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
                self.set_state(TcpState::Closed, io);
                Ok(())
            }
            TcpState::SynRcvd | TcpState::Established | TcpState::CloseWait => {
                self.fin_queued = true;
                self.send_pending(ctx, io)
            }
            _ => Ok(()),
        }
    }

    /// 发送 RST 并立即关闭
    pub fn abort(&mut self, ctx: &ConnCtx, io: &mut dyn Io) {
        if self.core.state == TcpState::Closed {
            return;
        }
        warn!(conn = self.conn, subflow = self.id, state = %self.core.state, "子流复位");
        if self.core.state != TcpState::SynSent {
            let seq = self.core.next_tx;
            self.transmit(TcpFlags::RST, seq, Vec::new(), Vec::new(), ctx, io);
        }
        self.set_state(TcpState::Closed, io);
    }

    // ---------------------------------------------------------------
    // 映射生命周期
    // ---------------------------------------------------------------

    /// 丢弃在子流级和连接级都已确认的发送映射
    pub fn discard_acked_tx_mappings(&mut self, data_una: u64) -> Vec<Mapping> {
        let snd_una = self.core.first_unacked;
        let removed = self
            .tx_mappings
            .discard_where(|m| m.tail_ssn().before(snd_una) && m.tail_dsn().before(data_una));
        for m in &removed {
            trace!(conn = self.conn, subflow = self.id, mapping = %m, "丢弃已确认映射");
        }
        removed
    }

    /// 尚未在连接级被确认的发送映射（子流失效时用于重注入）
    pub fn unacked_data_mappings(&self, data_una: u64) -> Vec<Mapping> {
        self.tx_mappings
            .iter()
            .filter(|m| data_una.before_or_eq(m.tail_dsn()))
            .copied()
            .collect()
    }

    /// 取出最旧接收映射的数据，至多 `max_size` 字节。
    ///
    /// `only_full_mapping` 时只在整段映射都已按序到达且不超过 `max_size` 时取出。
    /// 映射的字节全部取出后映射被丢弃。
    pub fn extract_at_most_one_mapping(
        &mut self,
        max_size: usize,
        only_full_mapping: bool,
    ) -> Result<Option<(u64, Vec<u8>)>> {
        loop {
            let Some(m) = self.rx_mappings.oldest() else {
                if self.core.rx.available() > 0 {
                    return Err(invariant_violation(format!(
                        "subflow {} has {} received bytes without mapping",
                        self.id,
                        self.core.rx.available()
                    )));
                }
                return Ok(None);
            };
            let head = self.core.rx.head();
            if m.tail_ssn().before(head) {
                self.rx_mappings.discard_mapping(&m);
                continue;
            }
            if head.before(m.head_ssn()) {
                if self.core.rx.available() > 0 {
                    return Err(invariant_violation(format!(
                        "subflow {} received SSN {head} precedes oldest mapping {m}",
                        self.id
                    )));
                }
                return Ok(None);
            }
            let remaining = head.distance_to(m.tail_ssn().advance(1));
            let avail = self.core.rx.available();
            if only_full_mapping && (avail < remaining || remaining > max_size) {
                return Ok(None);
            }
            let n = remaining.min(avail).min(max_size);
            if n == 0 {
                return Ok(None);
            }
            let Some(dsn) = m.dsn_for_ssn(head) else {
                return Err(invariant_violation(format!("mapping {m} does not cover {head}")));
            };
            let bytes = self.core.rx.read(n);
            if n == remaining {
                self.rx_mappings.discard_mapping(&m);
            }
            return Ok(Some((dsn, bytes)));
        }
    }

    fn add_rx_mapping(&mut self, dm: &DssMapping) -> Result<()> {
        if dm.is_pure_data_fin() {
            return Ok(());
        }
        let m = Mapping::new(dm.dsn, SeqNum(dm.ssn), dm.payload_len());
        if m.tail_ssn().before(self.core.rx.head()) || self.rx_mappings.contains(&m) {
            return Ok(());
        }
        if !self.rx_mappings.add_mapping(m) {
            return Err(invariant_violation(format!(
                "subflow {} received overlapping mapping {m}",
                self.id
            )));
        }
        trace!(conn = self.conn, subflow = self.id, mapping = %m, "登记接收映射");
        Ok(())
    }

    // ---------------------------------------------------------------
    // 接收
    // ---------------------------------------------------------------

    #[tracing::instrument(skip_all, fields(conn = self.conn, subflow = self.id, state = %self.core.state))]
    pub fn on_segment(&mut self, seg: TcpSegment, ctx: &ConnCtx, io: &mut dyn Io) -> Result<()> {
        if seg.header.flags.rst() {
            self.on_reset(io);
            return Ok(());
        }
        let opts = parse_options(&seg.header)?;
        match self.core.state {
            TcpState::Closed | TcpState::Listen => Ok(()),
            TcpState::SynSent => self.on_syn_sent(&seg, &opts, ctx, io),
            TcpState::SynRcvd => {
                if self.on_syn_rcvd(&seg, &opts, ctx, io)? {
                    self.on_synchronized(seg, opts, ctx, io)
                } else {
                    Ok(())
                }
            }
            _ => self.on_synchronized(seg, opts, ctx, io),
        }
    }

    fn on_reset(&mut self, io: &mut dyn Io) {
        warn!(conn = self.conn, subflow = self.id, "收到 RST");
        if self.core.state == TcpState::SynSent {
            self.events.push(SubflowEvent::ConnectFailed);
        } else {
            self.events.push(SubflowEvent::Reset);
        }
        self.set_state(TcpState::Closed, io);
    }

    fn take_timestamp(&mut self, h: &TcpHeader, io: &dyn Io, rtt_valid: bool) {
        let Some((val, ecr)) = h.timestamp() else {
            return;
        };
        let now = Self::now_us(io);
        if h.seq.before_or_eq(self.rcv_ack()) {
            self.ts_recent = val;
        }
        if rtt_valid {
            let rtt = now.wrapping_sub(ecr);
            if rtt < i32::MAX as u32 {
                self.rtt.sample(SimTime::from_micros(rtt as u64));
            }
            // 时钟同步：TSval − TSecr 近似前向单向时延
            let owd = val.wrapping_sub(ecr);
            if owd < i32::MAX as u32 {
                let sample = SimTime::from_micros(owd as u64);
                self.owd = Some(match self.owd {
                    None => sample,
                    Some(prev) => SimTime((7 * prev.0 + sample.0) / 8),
                });
            }
        }
    }

    fn on_syn_sent(
        &mut self,
        seg: &TcpSegment,
        opts: &[MptcpOption],
        ctx: &ConnCtx,
        io: &mut dyn Io,
    ) -> Result<()> {
        let h = &seg.header;
        if !(h.flags.syn() && h.flags.ack()) || h.ack != self.iss.wrapping_add(1) {
            return Ok(());
        }
        match &mut self.handshake {
            Handshake::Capable { peer_key, .. } => {
                let key = opts
                    .iter()
                    .find_map(|o| match o {
                        MptcpOption::Capable { sender_key, .. } => Some(*sender_key),
                        _ => None,
                    })
                    .ok_or(MptcpError::MalformedOption("SYN/ACK without MP_CAPABLE"))?;
                *peer_key = Some(key);
                self.events.push(SubflowEvent::PeerKey(key));
            }
            Handshake::Join {
                local_key,
                peer_key,
                local_nonce,
                peer_nonce,
                ..
            } => {
                let (mac, nonce, addr_id) = opts
                    .iter()
                    .find_map(|o| match o {
                        MptcpOption::Join(Join::SynAck {
                            truncated_hmac,
                            nonce,
                            addr_id,
                            ..
                        }) => Some((*truncated_hmac, *nonce, *addr_id)),
                        _ => None,
                    })
                    .ok_or(MptcpError::MalformedOption("SYN/ACK without MP_JOIN"))?;
                let expected = truncate_hmac(&join_hmac(*peer_key, *local_key, nonce, *local_nonce));
                if mac != expected {
                    return Err(MptcpError::AuthenticationFailed);
                }
                *peer_nonce = Some(nonce);
                self.remote_id = Some(addr_id);
            }
        }
        self.core.rx.reset(h.seq.wrapping_add(1));
        self.core.ack_up_to(h.ack);
        self.peer_window = h.window;
        self.cancel_timer(TimerKind::Retransmit, io);
        self.retries = 0;
        self.take_timestamp(h, io, true);
        self.set_state(TcpState::Established, io);
        self.send_handshake_ack(ctx, io);
        if self.role == SubflowRole::Join {
            // 等待第四个 ACK 前不发送数据；第三个 ACK 按 RTO 重传
            self.arm_rto(io);
        }
        Ok(())
    }

    /// 返回段是否还需要按已同步状态继续处理
    fn on_syn_rcvd(
        &mut self,
        seg: &TcpSegment,
        opts: &[MptcpOption],
        ctx: &ConnCtx,
        io: &mut dyn Io,
    ) -> Result<bool> {
        let h = &seg.header;
        if h.flags.syn() {
            // 对端重传了 SYN：我们的 SYN/ACK 丢了
            self.send_syn_ack(ctx, io);
            return Ok(false);
        }
        if !h.flags.ack() || h.ack != self.iss.wrapping_add(1) {
            return Ok(false);
        }
        match &self.handshake {
            Handshake::Join {
                local_key,
                peer_key,
                local_nonce,
                peer_nonce: Some(peer_nonce),
                ..
            } => {
                let hmac = opts
                    .iter()
                    .find_map(|o| match o {
                        MptcpOption::Join(Join::Ack { hmac }) => Some(*hmac),
                        _ => None,
                    })
                    .ok_or(MptcpError::MalformedOption("third ACK without MP_JOIN"))?;
                if hmac != join_hmac(*peer_key, *local_key, *peer_nonce, *local_nonce) {
                    return Err(MptcpError::AuthenticationFailed);
                }
                // 第四个 ACK
                self.ack_now = true;
            }
            Handshake::Join { .. } => {
                return Err(invariant_violation("passive join without peer nonce"));
            }
            Handshake::Capable { peer_key, .. } => {
                let echoed = opts.iter().find_map(|o| match o {
                    MptcpOption::Capable { sender_key, .. } => Some(*sender_key),
                    _ => None,
                });
                if let (Some(echoed), Some(peer_key)) = (echoed, peer_key) {
                    if echoed != *peer_key {
                        return Err(MptcpError::AuthenticationFailed);
                    }
                }
            }
        }
        self.core.ack_up_to(h.ack);
        self.peer_window = h.window;
        self.cancel_timer(TimerKind::Retransmit, io);
        self.retries = 0;
        self.take_timestamp(h, io, true);
        self.set_state(TcpState::Established, io);
        Ok(true)
    }
    fn on_synchronized(
        &mut self,
        seg: TcpSegment,
        opts: Vec<MptcpOption>,
        ctx: &ConnCtx,
        io: &mut dyn Io,
    ) -> Result<()> {
        let TcpSegment { header: h, payload } = seg;
        if h.flags.syn() {
            // 我们的第三个 ACK 丢失，对端重传了 SYN/ACK
            if h.flags.ack() && self.active {
                self.send_handshake_ack(ctx, io);
            }
            return Ok(());
        }

        if h.flags.ack() {
            self.process_ack(&h, payload.is_empty(), ctx, io)?;
            if !self.join_confirmed && self.active {
                debug!(conn = self.conn, subflow = self.id, "MP_JOIN 已被确认（第四个 ACK）");
                self.join_confirmed = true;
                if self.core.in_flight() == 0 {
                    self.cancel_timer(TimerKind::Retransmit, io);
                }
                self.retries = 0;
            }
        } else {
            self.take_timestamp(&h, io, false);
        }

        let seg_end = h.seq.advance(payload.len());
        for opt in opts {
            match opt {
                MptcpOption::Dss(dss) => {
                    if let Some(dm) = &dss.mapping {
                        if !payload.is_empty() && !dm.is_pure_data_fin() {
                            let m = Mapping::new(dm.dsn, SeqNum(dm.ssn), dm.payload_len());
                            let inside = m.covers_ssn(h.seq)
                                && seg_end.before_or_eq(m.tail_ssn().advance(1));
                            if !inside {
                                return Err(invariant_violation(format!(
                                    "mapping {m} does not cover segment [{}, {seg_end})",
                                    h.seq
                                )));
                            }
                        }
                        self.add_rx_mapping(dm)?;
                    }
                    self.events.push(SubflowEvent::Dss {
                        dss,
                        window: h.window,
                    });
                }
                MptcpOption::AddAddr {
                    addr_id,
                    addr,
                    port,
                } => {
                    let addr = SocketAddrV4::new(addr, port.unwrap_or(self.remote.port()));
                    self.events.push(SubflowEvent::AddAddr { addr_id, addr });
                }
                MptcpOption::RemoveAddr { ids } => self.events.push(SubflowEvent::RemoveAddr(ids)),
                MptcpOption::Capable { .. } | MptcpOption::Join(_) => {}
            }
        }

        if !payload.is_empty() {
            self.process_payload(h.seq, &payload)?;
        }
        if h.flags.fin() {
            self.process_fin(seg_end, io);
        }
        Ok(())
    }

    fn process_ack(&mut self, h: &TcpHeader, pure: bool, ctx: &ConnCtx, io: &mut dyn Io) -> Result<()> {
        let ack = h.ack;
        let mss = self.cfg.mss as u64;
        self.peer_window = h.window;
        if self.core.first_unacked.before(ack) && ack.before_or_eq(self.core.high_tx_mark) {
            let newly = self.core.ack_up_to(ack) as u64;
            self.take_timestamp(h, io, true);
            self.retries = 0;

            if let Some(fin) = self.fin_seq {
                if fin.before(ack) && !self.fin_acked {
                    self.fin_acked = true;
                    if let Some(next) = self.core.state.on_fin_acked() {
                        self.set_state(next, io);
                    }
                }
            }

            match self.recover {
                Some(recover) if recover.before_or_eq(ack) => {
                    // 完全确认，退出快速恢复
                    self.recover = None;
                    self.dup_acks = 0;
                    self.cwnd = self.ssthresh;
                }
                Some(_) => {
                    // 部分确认：重传下一个未确认段
                    self.retransmit_head(ctx, io)?;
                    self.cwnd = self.cwnd.saturating_sub(newly).saturating_add(mss).max(mss);
                }
                None => {
                    self.dup_acks = 0;
                    self.cwnd = increase_window(ctx.cc, self.cfg.mss, self.cwnd, self.ssthresh, newly);
                }
            }
            self.emit_cwnd(io);

            if self.core.in_flight() > 0 {
                self.arm_rto(io);
            } else {
                self.cancel_timer(TimerKind::Retransmit, io);
            }
        } else if ack == self.core.first_unacked && pure && !h.flags.fin() && self.core.in_flight() > 0 {
            self.take_timestamp(h, io, false);
            self.dup_acks += 1;
            if self.dup_acks == DUP_ACK_THRESHOLD && self.recover.is_none() {
                let flight = self.core.in_flight() as u64;
                self.ssthresh = (flight / 2).max(2 * mss);
                self.recover = Some(self.core.high_tx_mark);
                debug!(conn = self.conn, subflow = self.id, ack = %ack, "⚡ 3 dupACK 快速重传");
                self.retransmit_head(ctx, io)?;
                self.cwnd = self.ssthresh + 3 * mss;
                self.emit_cwnd(io);
            } else if self.dup_acks > DUP_ACK_THRESHOLD && self.recover.is_some() {
                self.cwnd = self.cwnd.saturating_add(mss);
            }
        } else {
            self.take_timestamp(h, io, false);
        }
        Ok(())
    }

    fn emit_cwnd(&mut self, io: &mut dyn Io) {
        io.viz(
            self.conn,
            VizEventKind::SubflowCwnd {
                conn: self.conn,
                subflow: self.id,
                cwnd: self.cwnd,
                ssthresh: self.ssthresh,
            },
        );
        self.events.push(SubflowEvent::NewCwnd(self.cwnd));
    }

    fn process_payload(&mut self, seq: SeqNum, payload: &[u8]) -> Result<()> {
        if !self.core.state.can_receive() {
            self.ack_now = true;
            return Ok(());
        }
        // 新到的字节必须都被某个映射覆盖
        let end = seq.advance(payload.len());
        let mut pos = seq.max_seq(self.core.rx.next());
        while pos.before(end) {
            let m = self.rx_mappings.get_mapping_for_ssn(pos).ok_or_else(|| {
                invariant_violation(format!(
                    "subflow {} received SSN {pos} without mapping",
                    self.id
                ))
            })?;
            pos = m.tail_ssn().advance(1);
        }

        let expected = self.core.rx.next();
        let advanced = self.core.rx.add(seq, payload);
        trace!(conn = self.conn, subflow = self.id, seq = %seq, len = payload.len(), advanced, "子流收到数据");
        if advanced > 0 {
            self.events.push(SubflowEvent::DataReceived);
        }
        let in_order = seq.before_or_eq(expected) && advanced > 0;
        if !in_order || self.core.rx.has_out_of_order() {
            self.ack_now = true;
        } else {
            self.delack_count += 1;
            if self.delack_count >= self.cfg.delayed_ack_count {
                self.ack_now = true;
            } else {
                self.ack_pending = true;
            }
        }
        Ok(())
    }

    fn process_fin(&mut self, fin_seq: SeqNum, io: &mut dyn Io) {
        self.ack_now = true;
        if self.fin_received || fin_seq != self.core.rx.next() {
            return;
        }
        debug!(conn = self.conn, subflow = self.id, seq = %fin_seq, "子流收到 FIN");
        self.fin_received = true;
        if let Some(next) = self.core.state.on_fin_received() {
            self.set_state(next, io);
        }
    }

    // ---------------------------------------------------------------
    // 定时器
    // ---------------------------------------------------------------

    pub fn on_timer(&mut self, kind: TimerKind, ctx: &ConnCtx, io: &mut dyn Io) -> Result<()> {
        match kind {
            TimerKind::Retransmit => {
                self.timers.rto = None;
                self.on_rto(ctx, io)
            }
            TimerKind::DelayedAck => {
                self.timers.delack = None;
                if self.ack_pending {
                    self.ack_now = true;
                }
                Ok(())
            }
            TimerKind::TimeWait => {
                self.timers.time_wait = None;
                self.set_state(TcpState::Closed, io);
                Ok(())
            }
            TimerKind::Persist | TimerKind::DataFinRetransmit => Ok(()),
        }
    }

    fn on_rto(&mut self, ctx: &ConnCtx, io: &mut dyn Io) -> Result<()> {
        match self.core.state {
            TcpState::SynSent => {
                self.retries += 1;
                if self.retries > self.cfg.syn_retries {
                    warn!(conn = self.conn, subflow = self.id, "SYN 重传次数耗尽");
                    self.events.push(SubflowEvent::ConnectFailed);
                    self.set_state(TcpState::Closed, io);
                    return Ok(());
                }
                self.rtt.back_off();
                self.send_syn(ctx, io);
                self.arm_rto(io);
            }
            TcpState::SynRcvd => {
                self.retries += 1;
                if self.retries > self.cfg.syn_retries {
                    self.events.push(SubflowEvent::Reset);
                    self.abort(ctx, io);
                    return Ok(());
                }
                self.rtt.back_off();
                self.send_syn_ack(ctx, io);
                self.arm_rto(io);
            }
            TcpState::Closed | TcpState::Listen | TcpState::TimeWait => {}
            _ if self.core.in_flight() == 0 => {
                if self.active && !self.join_confirmed {
                    self.retries += 1;
                    if self.retries > self.cfg.syn_retries {
                        self.events.push(SubflowEvent::Reset);
                        self.abort(ctx, io);
                        return Ok(());
                    }
                    self.rtt.back_off();
                    self.send_handshake_ack(ctx, io);
                    self.arm_rto(io);
                }
            }
            _ => {
                self.retries += 1;
                if self.retries > self.cfg.data_retries {
                    warn!(conn = self.conn, subflow = self.id, "数据重传次数耗尽");
                    self.events.push(SubflowEvent::Reset);
                    self.abort(ctx, io);
                    return Ok(());
                }
                let seq = self.core.first_unacked;
                info!(conn = self.conn, subflow = self.id, seq = %seq, rto = %self.rtt.rto(), "⏱️ 子流 RTO");
                io.viz(
                    self.conn,
                    VizEventKind::SubflowRto {
                        conn: self.conn,
                        subflow: self.id,
                        ssn: seq.0,
                    },
                );
                let mss = self.cfg.mss as u64;
                self.ssthresh = (self.core.in_flight() as u64 / 2).max(2 * mss);
                self.cwnd = mss;
                self.dup_acks = 0;
                self.recover = None;
                self.rtt.back_off();
                // 回退重传：从最早未确认处重新发送
                self.core.next_tx = seq;
                let len = self.retransmit_head(ctx, io)?;
                self.core.record_sent(seq.advance(len));
                self.arm_rto(io);
                self.emit_cwnd(io);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum HandshakeStage {
    Syn,
    SynAck,
    Ack,
}
