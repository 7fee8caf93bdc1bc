//! Meta 连接：应用看到的 MPTCP 连接
//!
//! 以 DSN（u64）为序列号空间运行一份 `TcpCore`，拥有全部子流（按 `SubflowId` 索引的
//! arena）。子流不直接改动这里的状态，它们排队的 [`SubflowEvent`] 由
//! [`MetaConnection::pump_events`] 统一处理。
//!
//! 连接级的关闭流程与 TCP 相同，只是由 DATA_FIN 驱动。

use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddrV4;

use tracing::{debug, info, trace, warn};

use crate::net::NodeId;
use crate::proto::tcp::{SeqNum, SequenceSpace, TcpCore, TcpSegment, TcpState};
use crate::sim::{EventId, SimTime};
use crate::viz::VizEventKind;

use super::config::MptcpConfig;
use super::crypto::token_and_idsn;
use super::error::{ErrorKind, MptcpError, Result};
use super::id_manager::AddressIdManager;
use super::io::{Io, TimerKey, TimerKind};
use super::lia::{CcInput, CongestionControlKind, PathSample, compute_alpha};
use super::options::MptcpOption;
use super::scheduler::{Scheduler, SchedulerInput, SubflowStatus, create_scheduler};
use super::socket::{AppEvent, AppId};
use super::subflow::{ConnCtx, Subflow, SubflowEvent, SubflowParams};
use super::{ConnId, SubflowId};

/// master 子流总是第一个创建
pub const MASTER_SUBFLOW: SubflowId = 0;

/// 一端的密钥及其派生值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key: u64,
    pub token: u32,
    pub idsn: u64,
}

impl KeyMaterial {
    pub fn from_key(key: u64) -> Self {
        let (token, idsn) = token_and_idsn(key);
        Self { key, token, idsn }
    }
}

/// 子流四元组的增删，交给协议栈维护分发表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TupleChange {
    Added {
        local: SocketAddrV4,
        remote: SocketAddrV4,
        subflow: SubflowId,
    },
    Removed {
        local: SocketAddrV4,
        remote: SocketAddrV4,
    },
}

#[derive(Debug, Default)]
struct MetaTimers {
    persist: Option<EventId>,
    data_fin: Option<EventId>,
    time_wait: Option<EventId>,
}

/// MP_JOIN 被动接受所需的参数
#[derive(Debug, Clone, Copy)]
pub(crate) struct JoinRequest {
    pub local: SocketAddrV4,
    pub peer_nonce: u32,
    pub remote_id: u8,
    pub backup: bool,
    pub local_nonce: u32,
    pub iss: SeqNum,
}

#[derive(Debug)]
pub struct MetaConnection {
    id: ConnId,
    host: NodeId,
    app: AppId,
    cfg: MptcpConfig,
    pub(crate) core: TcpCore<u64>,

    local: Option<KeyMaterial>,
    peer: Option<KeyMaterial>,
    bound: Option<SocketAddrV4>,
    remote: Option<SocketAddrV4>,
    /// 被动打开时派生出本连接的监听套接字
    listener: Option<ConnId>,
    started: bool,

    local_ids: AddressIdManager,
    remote_ids: AddressIdManager,

    subflows: Vec<Option<Subflow>>,
    others: BTreeSet<SubflowId>,
    established: BTreeSet<SubflowId>,
    closing: BTreeSet<SubflowId>,

    scheduler: Box<dyn Scheduler>,
    fully_established: bool,
    total_cwnd: u64,
    /// 对端连接级接收窗口右沿（DATA_ACK + window）
    snd_wnd_edge: u64,

    close_requested: bool,
    /// 本端 DATA_FIN 的 DSN
    data_fin_dsn: Option<u64>,
    data_fin_acked: bool,
    /// 对端 DATA_FIN 的 DSN（尚未按序到达前先记下）
    peer_data_fin: Option<u64>,
    data_fin_received: bool,
    data_fin_retries: u32,
    persist_backoff: u32,

    /// 子流失效后待重新映射的 (DSN, 长度)
    reinject: VecDeque<(u64, u16)>,
    timers: MetaTimers,

    app_events: VecDeque<AppEvent>,
    tuple_changes: Vec<TupleChange>,
}

impl MetaConnection {
    pub fn new(id: ConnId, host: NodeId, app: AppId, cfg: MptcpConfig) -> Self {
        let scheduler = create_scheduler(cfg.scheduler);
        let core = TcpCore::new(0, 0, 0, cfg.tx_buffer_bytes, cfg.rx_buffer_bytes);
        Self {
            id,
            host,
            app,
            core,
            local: None,
            peer: None,
            bound: None,
            remote: None,
            listener: None,
            started: false,
            local_ids: AddressIdManager::new(),
            remote_ids: AddressIdManager::new(),
            subflows: Vec::new(),
            others: BTreeSet::new(),
            established: BTreeSet::new(),
            closing: BTreeSet::new(),
            scheduler,
            fully_established: false,
            total_cwnd: 0,
            snd_wnd_edge: 0,
            close_requested: false,
            data_fin_dsn: None,
            data_fin_acked: false,
            peer_data_fin: None,
            data_fin_received: false,
            data_fin_retries: 0,
            persist_backoff: 0,
            reinject: VecDeque::new(),
            timers: MetaTimers::default(),
            app_events: VecDeque::new(),
            tuple_changes: Vec::new(),
            cfg,
        }
    }

    // ---------------------------------------------------------------
    // 查询
    // ---------------------------------------------------------------

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn host(&self) -> NodeId {
        self.host
    }

    pub fn app(&self) -> AppId {
        self.app
    }

    pub fn state(&self) -> TcpState {
        self.core.state
    }

    pub fn bound_addr(&self) -> Option<SocketAddrV4> {
        self.bound
    }

    pub fn remote_addr(&self) -> Option<SocketAddrV4> {
        self.remote
    }

    pub fn local_key(&self) -> Option<KeyMaterial> {
        self.local
    }

    pub fn peer_key(&self) -> Option<KeyMaterial> {
        self.peer
    }

    pub fn is_fully_established(&self) -> bool {
        self.fully_established
    }

    pub fn total_cwnd(&self) -> u64 {
        self.total_cwnd
    }

    pub fn scheduler_name(&self) -> &'static str {
        self.scheduler.name()
    }

    pub fn local_ids(&self) -> &AddressIdManager {
        &self.local_ids
    }

    pub fn remote_ids(&self) -> &AddressIdManager {
        &self.remote_ids
    }

    /// 仍存活的子流
    pub fn subflows(&self) -> impl Iterator<Item = &Subflow> + '_ {
        self.subflows.iter().flatten()
    }

    pub fn subflow(&self, id: SubflowId) -> Option<&Subflow> {
        self.subflows.get(id).and_then(Option::as_ref)
    }

    fn subflow_mut(&mut self, id: SubflowId) -> Option<&mut Subflow> {
        self.subflows.get_mut(id).and_then(Option::as_mut)
    }

    pub fn subflow_count(&self) -> usize {
        self.subflows().count()
    }

    pub fn established_subflows(&self) -> impl Iterator<Item = SubflowId> + '_ {
        self.established.iter().copied()
    }

    pub fn closing_subflows(&self) -> impl Iterator<Item = SubflowId> + '_ {
        self.closing.iter().copied()
    }

    /// 第一个未被连接级确认的 DSN
    pub fn data_una(&self) -> u64 {
        self.core.first_unacked
    }

    pub fn rx_available(&self) -> usize {
        self.core.rx.available()
    }

    pub fn tx_free(&self) -> usize {
        self.core.tx.free()
    }

    /// 连接已彻底结束，可以从协议栈中移除
    pub fn is_finished(&self) -> bool {
        self.started && self.core.state == TcpState::Closed && self.subflow_count() == 0
    }

    pub(crate) fn take_app_events(&mut self) -> Vec<AppEvent> {
        self.app_events.drain(..).collect()
    }

    pub(crate) fn take_tuple_changes(&mut self) -> Vec<TupleChange> {
        std::mem::take(&mut self.tuple_changes)
    }

    // ---------------------------------------------------------------
    // 密钥与窗口
    // ---------------------------------------------------------------

    /// 本端密钥决定发送方向的 IDSN；第一个数据字节为 IDSN + 1
    pub(crate) fn set_local_key(&mut self, key: u64) {
        let km = KeyMaterial::from_key(key);
        let start = km.idsn.wrapping_add(1);
        self.core.next_tx = start;
        self.core.first_unacked = start;
        self.core.high_tx_mark = start;
        self.core.tx.reset(start);
        self.snd_wnd_edge = start;
        self.local = Some(km);
    }

    fn set_peer_key(&mut self, key: u64) {
        if self.peer.is_some_and(|p| p.key == key) {
            return;
        }
        let km = KeyMaterial::from_key(key);
        self.core.rx.reset(km.idsn.wrapping_add(1));
        debug!(conn = self.id, token = km.token, "得知对端密钥");
        self.peer = Some(km);
    }

    /// 通告给对端的连接级窗口：meta 接收缓冲区余量减去子流中尚未取出的字节
    pub fn rcv_window(&self) -> u32 {
        let buffered: usize = self.subflows().map(Subflow::rx_buffered).sum();
        self.core
            .rx
            .free()
            .saturating_sub(buffered)
            .min(u32::MAX as usize) as u32
    }

    fn data_ack(&self) -> Option<u64> {
        self.peer
            .map(|_| self.core.rx.next().wrapping_add(u64::from(self.data_fin_received)))
    }

    /// 子流在拥塞避免阶段使用的耦合输入
    fn cc_input(&self, id: SubflowId) -> Result<CcInput> {
        if self.cfg.congestion_control == CongestionControlKind::Uncoupled {
            return Ok(CcInput::Uncoupled);
        }
        let in_ca = self
            .subflow(id)
            .is_some_and(Subflow::in_congestion_avoidance);
        let samples: Vec<PathSample> = self
            .established
            .iter()
            .filter_map(|&i| self.subflow(i))
            .map(|sf| PathSample {
                cwnd: sf.cwnd(),
                rtt_secs: sf.rtt().estimate().as_secs_f64(),
            })
            .collect();
        if !in_ca || samples.is_empty() {
            return Ok(CcInput::Uncoupled);
        }
        Ok(CcInput::Lia {
            alpha: compute_alpha(&samples)?,
            total_cwnd: self.total_cwnd,
            alpha_scale: self.cfg.alpha_scale,
        })
    }

    fn ctx_for(&self, id: SubflowId) -> Result<ConnCtx> {
        Ok(ConnCtx {
            data_ack: self.data_ack(),
            rcv_window: self.rcv_window(),
            cc: self.cc_input(id)?,
        })
    }

    /// 所有已建立子流的 cwnd 之和
    pub fn compute_total_cwnd(&mut self) -> u64 {
        let total = self
            .established
            .iter()
            .filter_map(|&i| self.subflow(i))
            .map(Subflow::cwnd)
            .sum();
        self.total_cwnd = total;
        total
    }

    /// 收到第一个 DSS；幂等，且一旦置位不再撤销
    pub fn become_fully_established(&mut self) {
        if self.fully_established {
            return;
        }
        info!(conn = self.id, "✅ MPTCP 连接完全建立");
        self.fully_established = true;
        self.app_events.push_back(AppEvent::FullyEstablished);
    }

    pub fn add_local_id(&mut self, id: u8, addr: SocketAddrV4) -> bool {
        self.local_ids.add_id(id, addr)
    }

    pub fn add_remote_id(&mut self, id: u8, addr: SocketAddrV4) -> bool {
        self.remote_ids.add_id(id, addr)
    }

    fn timer_key(&self, kind: TimerKind) -> TimerKey {
        TimerKey {
            conn: self.id,
            subflow: None,
            kind,
        }
    }

    fn params(&self, id: SubflowId, local: SocketAddrV4, remote: SocketAddrV4, local_id: u8, iss: SeqNum) -> SubflowParams {
        SubflowParams {
            conn: self.id,
            id,
            local,
            remote,
            local_id,
            iss,
            tcp: self.cfg.tcp.clone(),
            tx_capacity: self.cfg.tx_buffer_bytes,
            rx_capacity: self.cfg.rx_buffer_bytes,
        }
    }

    fn push_subflow(&mut self, sf: Subflow) -> SubflowId {
        let id = sf.id();
        self.tuple_changes.push(TupleChange::Added {
            local: sf.local_addr(),
            remote: sf.remote_addr(),
            subflow: id,
        });
        self.subflows.push(Some(sf));
        self.others.insert(id);
        id
    }

    fn set_meta_state(&mut self, new: TcpState, io: &mut dyn Io) {
        let old = self.core.set_state(new);
        if old == new {
            return;
        }
        info!(conn = self.id, %old, %new, "🔁 meta 状态变化");
        io.viz(
            self.id,
            VizEventKind::MetaState {
                conn: self.id,
                old,
                new,
            },
        );
        match new {
            TcpState::TimeWait => {
                self.cancel_timer(TimerKind::DataFinRetransmit, io);
                self.cancel_timer(TimerKind::Persist, io);
                let id = io.schedule(self.cfg.tcp.time_wait, self.timer_key(TimerKind::TimeWait));
                self.timers.time_wait = Some(id);
            }
            TcpState::Closed => {
                self.cancel_timer(TimerKind::DataFinRetransmit, io);
                self.cancel_timer(TimerKind::Persist, io);
                self.cancel_timer(TimerKind::TimeWait, io);
                if matches!(old, TcpState::LastAck | TcpState::TimeWait | TcpState::Listen) {
                    self.app_events.push_back(AppEvent::Closed);
                }
            }
            _ => {}
        }
    }

    fn cancel_timer(&mut self, kind: TimerKind, io: &mut dyn Io) {
        let slot = match kind {
            TimerKind::Persist => &mut self.timers.persist,
            TimerKind::DataFinRetransmit => &mut self.timers.data_fin,
            TimerKind::TimeWait => &mut self.timers.time_wait,
            TimerKind::Retransmit | TimerKind::DelayedAck => return,
        };
        if let Some(id) = slot.take() {
            io.cancel(id);
        }
    }

    // ---------------------------------------------------------------
    // 打开
    // ---------------------------------------------------------------

    pub fn bind(&mut self, addr: SocketAddrV4) -> Result<()> {
        if self.core.state != TcpState::Closed || self.started {
            return Err(MptcpError::InvalidState(self.core.state));
        }
        self.bound = Some(addr);
        Ok(())
    }

    pub fn listen(&mut self, io: &mut dyn Io) -> Result<()> {
        if self.bound.is_none() {
            return Err(MptcpError::NotBound);
        }
        if self.core.state != TcpState::Closed || self.started {
            return Err(MptcpError::InvalidState(self.core.state));
        }
        self.started = true;
        self.set_meta_state(TcpState::Listen, io);
        Ok(())
    }

    /// 主动打开：创建 master 子流并发送 MP_CAPABLE SYN
    pub fn connect(&mut self, remote: SocketAddrV4, key: u64, iss: SeqNum, io: &mut dyn Io) -> Result<SubflowId> {
        let local = self.bound.ok_or(MptcpError::NotBound)?;
        if self.core.state != TcpState::Closed || self.started {
            return Err(MptcpError::InvalidState(self.core.state));
        }
        self.started = true;
        self.set_local_key(key);
        self.remote = Some(remote);
        self.local_ids.add_id(0, local);
        self.remote_ids.add_id(0, remote);

        let id = self.subflows.len();
        let sf = Subflow::new_master_active(self.params(id, local, remote, 0, iss), key);
        self.push_subflow(sf);
        self.app_events.push_back(AppEvent::SubflowCreated(id));
        self.set_meta_state(TcpState::SynSent, io);

        let ctx = self.ctx_for(id)?;
        if let Some(sf) = self.subflow_mut(id) {
            sf.connect(&ctx, io);
        }
        self.pump_events(io)?;
        Ok(id)
    }

    /// 被动打开：监听套接字收到 MP_CAPABLE SYN 后派生出的新连接
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn accept_master(
        &mut self,
        listener: ConnId,
        syn: &TcpSegment,
        local: SocketAddrV4,
        peer_key: u64,
        key: u64,
        iss: SeqNum,
        io: &mut dyn Io,
    ) -> Result<SubflowId> {
        let remote = syn.header.src;
        self.started = true;
        self.listener = Some(listener);
        self.bound = Some(local);
        self.remote = Some(remote);
        self.set_local_key(key);
        self.set_peer_key(peer_key);
        self.local_ids.add_id(0, local);
        self.remote_ids.add_id(0, remote);

        let id = self.subflows.len();
        let sf = Subflow::new_master_passive(self.params(id, local, remote, 0, iss), key, peer_key, syn.header.seq);
        self.push_subflow(sf);
        self.set_meta_state(TcpState::SynRcvd, io);

        let ctx = self.ctx_for(id)?;
        if let Some(sf) = self.subflow_mut(id) {
            sf.accept(syn, &ctx, io);
        }
        self.pump_events(io)?;
        Ok(id)
    }

    /// 被动接受一个 MP_JOIN 子流（令牌已由协议栈匹配）
    pub(crate) fn accept_join(&mut self, syn: &TcpSegment, req: JoinRequest, io: &mut dyn Io) -> Result<SubflowId> {
        if !self.core.state.can_send() && !self.core.state.can_receive() {
            return Err(MptcpError::InvalidState(self.core.state));
        }
        let (Some(local_key), Some(peer)) = (self.local, self.peer) else {
            return Err(MptcpError::NotFullyEstablished);
        };
        let remote = syn.header.src;
        let local_id = self
            .local_ids
            .allocate(req.local)
            .ok_or(MptcpError::AddressIdExhausted)?;
        if !self.remote_ids.add_id(req.remote_id, remote) && !self.remote_ids.contains(req.remote_id, remote) {
            warn!(conn = self.id, addr_id = req.remote_id, %remote, "远端地址 id 冲突");
        }

        let id = self.subflows.len();
        let sf = Subflow::new_join_passive(
            self.params(id, req.local, remote, local_id, req.iss),
            local_key.key,
            peer.key,
            req.local_nonce,
            req.peer_nonce,
            req.remote_id,
            req.backup,
            syn.header.seq,
        );
        info!(conn = self.id, subflow = id, local = %req.local, %remote, "接受 MP_JOIN 子流");
        self.push_subflow(sf);
        self.app_events.push_back(AppEvent::SubflowCreated(id));

        let ctx = self.ctx_for(id)?;
        if let Some(sf) = self.subflow_mut(id) {
            sf.accept(syn, &ctx, io);
        }
        self.pump_events(io)?;
        Ok(id)
    }

    /// 以 MP_JOIN 建立额外子流。连接必须已完全建立。
    pub fn connect_new_subflow(
        &mut self,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        iss: SeqNum,
        nonce: u32,
        io: &mut dyn Io,
    ) -> Result<SubflowId> {
        if !self.fully_established {
            return Err(MptcpError::NotFullyEstablished);
        }
        if !self.core.state.can_send() {
            return Err(MptcpError::InvalidState(self.core.state));
        }
        let (Some(local_key), Some(peer)) = (self.local, self.peer) else {
            return Err(MptcpError::NotFullyEstablished);
        };
        if self
            .subflows()
            .any(|sf| sf.local_addr() == local && sf.remote_addr() == remote)
        {
            return Err(MptcpError::AddressInUse(local));
        }
        let local_id = self
            .local_ids
            .allocate(local)
            .ok_or(MptcpError::AddressIdExhausted)?;

        let id = self.subflows.len();
        let sf = Subflow::new_join_active(
            self.params(id, local, remote, local_id, iss),
            local_key.key,
            peer.key,
            peer.token,
            nonce,
            false,
        );
        info!(conn = self.id, subflow = id, %local, %remote, "➕ 发起 MP_JOIN 子流");
        self.push_subflow(sf);
        self.app_events.push_back(AppEvent::SubflowCreated(id));

        let ctx = self.ctx_for(id)?;
        if let Some(sf) = self.subflow_mut(id) {
            sf.connect(&ctx, io);
        }
        self.pump_events(io)?;
        Ok(id)
    }

    // ---------------------------------------------------------------
    // 应用接口
    // ---------------------------------------------------------------

    /// 写入连接级发送缓冲区；缓冲区满时返回 0
    pub fn send(&mut self, data: &[u8], io: &mut dyn Io) -> Result<usize> {
        if !self.core.state.can_send() || self.close_requested {
            return Err(MptcpError::InvalidState(self.core.state));
        }
        let n = self.core.tx.append(data);
        trace!(conn = self.id, requested = data.len(), accepted = n, "应用写入");
        if n > 0 {
            self.after_activity(io)?;
        }
        Ok(n)
    }

    /// 读取至多 `max` 个按序字节
    pub fn recv(&mut self, max: usize, io: &mut dyn Io) -> Result<Vec<u8>> {
        let before = self.rcv_window();
        let out = self.core.rx.read(max);
        if out.is_empty() {
            return Ok(out);
        }
        // 腾出的空间可能让子流中积压的映射继续交付
        for id in 0..self.subflows.len() {
            self.on_subflow_recv(id, io)?;
        }
        self.check_peer_data_fin(io);
        self.maybe_window_update(before);
        self.after_activity(io)?;
        Ok(out)
    }

    /// 窗口从不足一个 MSS 恢复，或增长超过缓冲区一半时立即通告
    fn maybe_window_update(&mut self, before: u32) {
        let after = self.rcv_window();
        let mss = self.cfg.tcp.mss;
        let half = (self.cfg.rx_buffer_bytes / 2).min(u32::MAX as usize) as u32;
        let ids: Vec<SubflowId> = self.established.iter().copied().collect();
        for id in ids {
            if let Some(sf) = self.subflow_mut(id) {
                let grown = after.saturating_sub(sf.last_advertised_window());
                if (before < mss && after >= mss) || grown >= half {
                    sf.request_ack();
                }
            }
        }
    }

    /// 请求关闭：待发数据全部映射后发送 DATA_FIN
    pub fn close(&mut self, io: &mut dyn Io) -> Result<()> {
        match self.core.state {
            TcpState::Closed | TcpState::Listen => {
                self.started = true;
                self.set_meta_state(TcpState::Closed, io);
                Ok(())
            }
            TcpState::SynSent | TcpState::SynRcvd => {
                self.abort(io)?;
                self.app_events.push_back(AppEvent::Closed);
                Ok(())
            }
            TcpState::Established | TcpState::CloseWait => {
                if !self.close_requested {
                    debug!(conn = self.id, pending = self.core.unsent(), "应用请求关闭");
                    self.close_requested = true;
                }
                self.after_activity(io)
            }
            _ => Ok(()),
        }
    }

    /// 复位所有子流并立即关闭
    pub fn abort(&mut self, io: &mut dyn Io) -> Result<()> {
        warn!(conn = self.id, state = %self.core.state, "meta 连接中止");
        self.set_meta_state(TcpState::Closed, io);
        for id in 0..self.subflows.len() {
            let ctx = self.ctx_for(id).unwrap_or(ConnCtx {
                data_ack: self.data_ack(),
                rcv_window: 0,
                cc: CcInput::Uncoupled,
            });
            if let Some(sf) = self.subflow_mut(id) {
                sf.abort(&ctx, io);
            }
        }
        self.reinject.clear();
        self.pump_events(io)
    }

    /// 不变量被破坏后的收尾：复位全部子流并通知应用
    pub(crate) fn fail(&mut self, io: &mut dyn Io) {
        if let Err(e) = self.abort(io) {
            warn!(conn = self.id, error = %e, "中止连接时再次出错");
        }
        self.app_events.push_back(AppEvent::Reset);
    }

    /// 通告一个本地地址（ADD_ADDR），返回分配的地址 id
    pub fn advertise_address(&mut self, addr: SocketAddrV4, io: &mut dyn Io) -> Result<u8> {
        let sig = self
            .signal_subflow()
            .ok_or(MptcpError::NotFullyEstablished)?;
        let id = self
            .local_ids
            .allocate(addr)
            .ok_or(MptcpError::AddressIdExhausted)?;
        info!(conn = self.id, addr_id = id, %addr, "📢 ADD_ADDR");
        if let Some(sf) = self.subflow_mut(sig) {
            sf.queue_signal(MptcpOption::AddAddr {
                addr_id: id,
                addr: *addr.ip(),
                port: Some(addr.port()),
            });
        }
        self.after_activity(io)?;
        Ok(id)
    }

    /// 撤回本地地址：发送 REMOVE_ADDR 并关闭使用该地址的子流
    pub fn withdraw_address(&mut self, addr_id: u8, io: &mut dyn Io) -> Result<()> {
        let addr = self
            .local_ids
            .remove_id(addr_id)
            .ok_or(MptcpError::UnknownAddressId(addr_id))?;
        info!(conn = self.id, addr_id, %addr, "REMOVE_ADDR");
        let carrier = self
            .established
            .iter()
            .copied()
            .find(|&i| self.subflow(i).is_some_and(|sf| sf.local_addr() != addr))
            .or_else(|| self.signal_subflow());
        if let Some(sf) = carrier.and_then(|i| self.subflow_mut(i)) {
            sf.queue_signal(MptcpOption::RemoveAddr { ids: vec![addr_id] });
        }
        self.flush_acks(io)?;
        let victims: Vec<SubflowId> = self
            .subflows()
            .filter(|sf| sf.local_addr() == addr)
            .map(Subflow::id)
            .collect();
        self.close_subflows(&victims, io)?;
        self.after_activity(io)
    }

    /// 用于携带信令的子流：优先已建立的
    fn signal_subflow(&self) -> Option<SubflowId> {
        self.established.iter().copied().next().or_else(|| {
            self.subflows()
                .find(|sf| sf.state().is_synchronized())
                .map(Subflow::id)
        })
    }

    fn close_subflows(&mut self, ids: &[SubflowId], io: &mut dyn Io) -> Result<()> {
        for &id in ids {
            let ctx = self.ctx_for(id)?;
            if let Some(sf) = self.subflow_mut(id) {
                sf.close(&ctx, io)?;
            }
        }
        Ok(())
    }

    fn close_all_subflows(&mut self, io: &mut dyn Io) -> Result<()> {
        let ids: Vec<SubflowId> = self.subflows().map(Subflow::id).collect();
        self.close_subflows(&ids, io)
    }

    // ---------------------------------------------------------------
    // 子流驱动
    // ---------------------------------------------------------------

    /// 交给子流处理一个段，然后处理其事件并推进发送
    #[tracing::instrument(skip_all, fields(conn = self.id, subflow = id))]
    pub fn on_subflow_segment(&mut self, id: SubflowId, seg: TcpSegment, io: &mut dyn Io) -> Result<()> {
        let ctx = self.ctx_for(id)?;
        let conn = self.id;
        let opening = self.core.state == TcpState::SynSent && id == MASTER_SUBFLOW;
        let Some(sf) = self.subflows.get_mut(id).and_then(Option::as_mut) else {
            return Ok(());
        };
        if let Err(e) = sf.on_segment(seg, &ctx, io) {
            if e.kind() != ErrorKind::PeerProtocol {
                return Err(e);
            }
            warn!(conn, subflow = id, error = %e, "对端协议错误，复位子流");
            sf.abort(&ctx, io);
            if opening {
                self.app_events.push_back(AppEvent::ConnectFailed);
            }
        }
        self.after_activity(io)
    }

    /// 子流或 meta 定时器
    pub fn on_timer(&mut self, key: TimerKey, io: &mut dyn Io) -> Result<()> {
        match key.subflow {
            Some(id) => {
                let ctx = self.ctx_for(id)?;
                if let Some(sf) = self.subflow_mut(id) {
                    sf.on_timer(key.kind, &ctx, io)?;
                }
            }
            None => match key.kind {
                TimerKind::Persist => self.on_persist(io)?,
                TimerKind::DataFinRetransmit => self.on_data_fin_timeout(io)?,
                TimerKind::TimeWait => {
                    self.timers.time_wait = None;
                    self.set_meta_state(TcpState::Closed, io);
                    self.close_all_subflows(io)?;
                }
                TimerKind::Retransmit | TimerKind::DelayedAck => {}
            },
        }
        self.after_activity(io)
    }

    /// 处理事件、清理映射、调度发送、发出 ACK，直到子流不再产生新事件
    fn after_activity(&mut self, io: &mut dyn Io) -> Result<()> {
        loop {
            self.pump_events(io)?;
            let data_una = self.core.first_unacked;
            for sf in self.subflows.iter_mut().flatten() {
                sf.discard_acked_tx_mappings(data_una);
            }
            self.send_pending(io)?;
            self.flush_acks(io)?;
            if !self.subflows().any(Subflow::has_events) {
                return Ok(());
            }
        }
    }

    fn flush_acks(&mut self, io: &mut dyn Io) -> Result<()> {
        for id in 0..self.subflows.len() {
            if self.subflow(id).is_none() {
                continue;
            }
            let ctx = self.ctx_for(id)?;
            if let Some(sf) = self.subflow_mut(id) {
                sf.flush_ack(&ctx, io);
            }
        }
        Ok(())
    }

    /// 取走并处理全部子流事件
    pub(crate) fn pump_events(&mut self, io: &mut dyn Io) -> Result<()> {
        loop {
            let mut handled = false;
            for id in 0..self.subflows.len() {
                let events = match self.subflow_mut(id) {
                    Some(sf) => sf.drain_events(),
                    None => continue,
                };
                for ev in events {
                    handled = true;
                    self.on_subflow_event(id, ev, io)?;
                }
            }
            if !handled {
                return Ok(());
            }
        }
    }

    fn on_subflow_event(&mut self, id: SubflowId, ev: SubflowEvent, io: &mut dyn Io) -> Result<()> {
        trace!(conn = self.id, subflow = id, ?ev, "子流事件");
        match ev {
            SubflowEvent::StateChanged { old, new } => self.on_subflow_new_state(id, old, new, io)?,
            SubflowEvent::PeerKey(key) => self.set_peer_key(key),
            SubflowEvent::Dss { dss, window } => {
                self.become_fully_established();
                if let Some(ack) = dss.data_ack {
                    self.on_data_ack(ack, window, io);
                }
                if let Some(dsn) = dss.mapping.and_then(|m| m.data_fin_dsn()) {
                    if self.data_fin_received {
                        // 重传的 DATA_FIN：在收到它的子流上再确认一次
                        if let Some(sf) = self.subflow_mut(id) {
                            sf.request_ack();
                        }
                    } else {
                        if self.peer_data_fin.is_none() {
                            debug!(conn = self.id, dsn, "收到 DATA_FIN");
                        }
                        self.peer_data_fin = Some(dsn);
                        self.check_peer_data_fin(io);
                    }
                }
            }
            SubflowEvent::DataReceived => self.on_subflow_recv(id, io)?,
            SubflowEvent::NewCwnd(_) => {
                self.compute_total_cwnd();
            }
            SubflowEvent::AddAddr { addr_id, addr } => {
                if self.remote_ids.add_id(addr_id, addr) {
                    info!(conn = self.id, addr_id, %addr, "对端通告新地址");
                } else if self.remote_ids.contains(addr_id, addr) {
                    trace!(conn = self.id, addr_id, %addr, "重复的 ADD_ADDR");
                } else {
                    warn!(conn = self.id, addr_id, %addr, "ADD_ADDR 与已知地址冲突，忽略");
                }
            }
            SubflowEvent::RemoveAddr(ids) => {
                for addr_id in ids {
                    let Some(addr) = self.remote_ids.remove_id(addr_id) else {
                        continue;
                    };
                    info!(conn = self.id, addr_id, %addr, "对端撤回地址");
                    let victims: Vec<SubflowId> = self
                        .subflows()
                        .filter(|sf| sf.remote_addr() == addr)
                        .map(Subflow::id)
                        .collect();
                    self.close_subflows(&victims, io)?;
                }
            }
            SubflowEvent::Reset => {
                debug!(conn = self.id, subflow = id, "子流被复位");
            }
            SubflowEvent::ConnectFailed => {
                if id == MASTER_SUBFLOW && self.core.state == TcpState::SynSent {
                    warn!(conn = self.id, "❌ 连接失败");
                    self.app_events.push_back(AppEvent::ConnectFailed);
                } else {
                    warn!(conn = self.id, subflow = id, "MP_JOIN 子流建立失败");
                }
            }
        }
        Ok(())
    }

    fn on_subflow_new_state(&mut self, id: SubflowId, old: TcpState, new: TcpState, io: &mut dyn Io) -> Result<()> {
        trace!(conn = self.id, subflow = id, %old, %new, "子流状态通知");
        match new {
            TcpState::Established => {
                self.others.remove(&id);
                self.established.insert(id);
                let (remote_id, remote, peer_window) = match self.subflow(id) {
                    Some(sf) => (sf.remote_id(), sf.remote_addr(), sf.peer_window()),
                    None => return Ok(()),
                };
                if let Some(rid) = remote_id {
                    self.remote_ids.add_id(rid, remote);
                }
                if id == MASTER_SUBFLOW {
                    // 握手窗口作为连接级初始窗口
                    self.snd_wnd_edge = self
                        .snd_wnd_edge
                        .max(self.core.next_tx.wrapping_add(peer_window as u64));
                    match self.core.state {
                        TcpState::SynSent => {
                            self.set_meta_state(TcpState::Established, io);
                            self.app_events.push_back(AppEvent::Connected);
                        }
                        TcpState::SynRcvd => {
                            self.set_meta_state(TcpState::Established, io);
                            let listener = self.listener.unwrap_or(self.id);
                            self.app_events.push_back(AppEvent::Accepted { listener });
                            // 立即回一个 DSS，让对端进入完全建立
                            if let Some(sf) = self.subflow_mut(id) {
                                sf.request_ack();
                            }
                        }
                        _ => {}
                    }
                }
                self.app_events.push_back(AppEvent::SubflowConnected(id));
                self.compute_total_cwnd();
            }
            TcpState::Closed => self.on_subflow_closed(id, io)?,
            s if s.is_closing() => {
                self.others.remove(&id);
                if self.established.remove(&id) {
                    self.compute_total_cwnd();
                }
                self.closing.insert(id);
            }
            _ => {}
        }
        Ok(())
    }

    /// 子流关闭：释放 arena 槽位，未确认的映射排队重注入
    fn on_subflow_closed(&mut self, id: SubflowId, io: &mut dyn Io) -> Result<()> {
        let Some(sf) = self.subflows.get_mut(id).and_then(Option::take) else {
            return Ok(());
        };
        self.others.remove(&id);
        self.established.remove(&id);
        self.closing.remove(&id);
        self.tuple_changes.push(TupleChange::Removed {
            local: sf.local_addr(),
            remote: sf.remote_addr(),
        });
        self.compute_total_cwnd();

        let data_una = self.core.first_unacked;
        if self.core.state.is_synchronized() && !self.data_fin_acked {
            for m in sf.unacked_data_mappings(data_una) {
                let start = if m.head_dsn().before(data_una) { data_una } else { m.head_dsn() };
                let len = start.distance_to(m.tail_dsn().wrapping_add(1));
                if len == 0 {
                    continue;
                }
                debug!(conn = self.id, subflow = id, dsn = start, len, "🔁 排队重注入");
                self.reinject.push_back((start, len as u16));
            }
            self.reinject
                .make_contiguous()
                .sort_unstable_by_key(|&(dsn, _)| dsn.offset_from(data_una));
        }
        info!(conn = self.id, subflow = id, remaining = self.subflow_count(), "子流已释放");

        if self.subflow_count() == 0 {
            match self.core.state {
                TcpState::Closed | TcpState::TimeWait | TcpState::Listen => {}
                TcpState::SynSent | TcpState::SynRcvd => self.set_meta_state(TcpState::Closed, io),
                _ => {
                    warn!(conn = self.id, "最后一个子流失效，连接复位");
                    self.app_events.push_back(AppEvent::Reset);
                    self.set_meta_state(TcpState::Closed, io);
                }
            }
        }
        Ok(())
    }

    /// 从子流取出完整映射放入连接级接收缓冲区；有进展时通知应用一次
    pub fn on_subflow_recv(&mut self, id: SubflowId, io: &mut dyn Io) -> Result<()> {
        let mut advanced = 0usize;
        loop {
            let Some(sf) = self.subflows.get_mut(id).and_then(Option::as_mut) else {
                break;
            };
            // 以接收窗口内的剩余空间为界，保证子流已确认的数据不会在连接级被丢弃
            let room = sf.next_rx_dsn().map_or(0, |dsn| self.core.rx.room_at(dsn));
            let Some((dsn, bytes)) = sf.extract_at_most_one_mapping(room, true)? else {
                break;
            };
            let n = self.core.rx.add(dsn, &bytes);
            trace!(conn = self.id, subflow = id, dsn, len = bytes.len(), advanced = n, "连接级收到数据");
            advanced += n;
        }
        if advanced > 0 {
            self.app_events.push_back(AppEvent::DataAvailable);
            self.check_peer_data_fin(io);
        }
        Ok(())
    }

    fn on_data_ack(&mut self, ack: u64, window: u32, io: &mut dyn Io) {
        if self.core.high_tx_mark.before(ack) {
            trace!(conn = self.id, ack, "DATA_ACK 超出已发送范围，忽略");
            return;
        }
        if self.core.first_unacked.before_or_eq(ack) {
            self.snd_wnd_edge = self.snd_wnd_edge.max(ack.wrapping_add(window as u64));
        }
        if self.snd_wnd_edge.after(self.core.next_tx) {
            self.persist_backoff = 0;
            self.cancel_timer(TimerKind::Persist, io);
        }
        let newly = self.core.ack_up_to(ack);
        if newly == 0 {
            return;
        }
        trace!(conn = self.id, ack, newly, "DATA_ACK 推进");
        self.reinject.retain_mut(|(dsn, len)| {
            let end = dsn.wrapping_add(*len as u64);
            if end.before_or_eq(ack) {
                return false;
            }
            if dsn.before(ack) {
                *len = ack.distance_to(end) as u16;
                *dsn = ack;
            }
            true
        });

        if let Some(dfin) = self.data_fin_dsn {
            if dfin.before(ack) && !self.data_fin_acked {
                debug!(conn = self.id, dsn = dfin, "DATA_FIN 已被确认");
                self.data_fin_acked = true;
                self.data_fin_retries = 0;
                self.cancel_timer(TimerKind::DataFinRetransmit, io);
                if let Some(next) = self.core.state.on_fin_acked() {
                    self.set_meta_state(next, io);
                    if matches!(next, TcpState::TimeWait | TcpState::Closed) {
                        if let Err(e) = self.close_all_subflows(io) {
                            warn!(conn = self.id, error = %e, "关闭子流失败");
                        }
                    }
                }
            }
        }

        if self.core.state.can_send() && !self.close_requested && self.core.tx.free() > 0 {
            self.app_events.push_back(AppEvent::SendPossible(self.core.tx.free()));
        }
    }

    /// 对端 DATA_FIN 之前的数据都已按序到达时消耗它
    fn check_peer_data_fin(&mut self, io: &mut dyn Io) {
        let Some(dsn) = self.peer_data_fin else {
            return;
        };
        if self.data_fin_received || self.core.rx.next() != dsn {
            return;
        }
        info!(conn = self.id, dsn, "对端关闭（DATA_FIN 按序到达）");
        self.data_fin_received = true;
        if let Some(next) = self.core.state.on_fin_received() {
            self.set_meta_state(next, io);
            if next == TcpState::TimeWait {
                if let Err(e) = self.close_all_subflows(io) {
                    warn!(conn = self.id, error = %e, "关闭子流失败");
                }
            }
        }
        self.app_events.push_back(AppEvent::PeerClosed);
        let ids: Vec<SubflowId> = self.established.iter().copied().collect();
        for id in ids {
            if let Some(sf) = self.subflow_mut(id) {
                sf.request_ack();
            }
        }
    }

    // ---------------------------------------------------------------
    // 发送调度
    // ---------------------------------------------------------------

    fn sendable_statuses(&self) -> Vec<SubflowStatus> {
        self.established
            .iter()
            .filter_map(|&i| self.subflow(i))
            .filter(|sf| sf.can_send_data())
            .map(Subflow::status)
            .collect()
    }

    /// 把 `[dsn, dsn + len)` 映射到 `subflow` 上并尝试发送
    fn map_onto(&mut self, subflow: SubflowId, dsn: u64, len: u16, io: &mut dyn Io) -> Result<usize> {
        let bytes = self.core.tx.copy_range(dsn, len as usize);
        if bytes.is_empty() {
            return Ok(0);
        }
        let ctx = self.ctx_for(subflow)?;
        let Some(sf) = self.subflow_mut(subflow) else {
            return Ok(0);
        };
        sf.add_loose_mapping(dsn, &bytes, io)?;
        sf.send_pending(&ctx, io)?;
        Ok(bytes.len())
    }

    /// 子流重传/续发，然后重注入、新数据映射、DATA_FIN、零窗口探测
    fn send_pending(&mut self, io: &mut dyn Io) -> Result<()> {
        if !self.core.state.is_synchronized() {
            return Ok(());
        }
        for id in 0..self.subflows.len() {
            if self.subflow(id).is_none() {
                continue;
            }
            let ctx = self.ctx_for(id)?;
            if let Some(sf) = self.subflow_mut(id) {
                sf.send_pending(&ctx, io)?;
            }
        }

        let mss = self.cfg.tcp.mss;
        while let Some(&(dsn, len)) = self.reinject.front() {
            let statuses = self.sendable_statuses();
            let input = SchedulerInput {
                unmapped: len as u64,
                conn_window: len as u64,
                segment_size: mss,
                next_dsn: dsn,
                subflows: &statuses,
            };
            let Some(chunk) = self.scheduler.generate_mapping(&input) else {
                break;
            };
            let sent = self.map_onto(chunk.subflow, dsn, chunk.length, io)?;
            if sent == 0 {
                self.reinject.pop_front();
                continue;
            }
            debug!(conn = self.id, subflow = chunk.subflow, dsn, len = sent, "重注入");
            if let Some(front) = self.reinject.front_mut() {
                if sent >= front.1 as usize {
                    self.reinject.pop_front();
                } else {
                    front.0 = front.0.wrapping_add(sent as u64);
                    front.1 -= sent as u16;
                }
            }
        }

        loop {
            let statuses = self.sendable_statuses();
            let next_dsn = self.core.next_tx;
            let input = SchedulerInput {
                unmapped: self.core.unsent() as u64,
                conn_window: next_dsn.distance_to(self.snd_wnd_edge) as u64,
                segment_size: mss,
                next_dsn,
                subflows: &statuses,
            };
            let Some(chunk) = self.scheduler.generate_mapping(&input) else {
                break;
            };
            let sent = self.map_onto(chunk.subflow, chunk.dsn, chunk.length, io)?;
            if sent == 0 {
                break;
            }
            self.core.record_sent(chunk.dsn.wrapping_add(sent as u64));
        }

        if self.close_requested
            && self.data_fin_dsn.is_none()
            && self.core.unsent() == 0
            && self.reinject.is_empty()
            && self.core.state.can_send()
        {
            let dsn = self.core.tx.tail();
            self.data_fin_dsn = Some(dsn);
            self.core.record_sent(dsn.wrapping_add(1));
            if let Some(next) = self.core.state.on_close() {
                self.set_meta_state(next, io);
            }
            self.transmit_data_fin(io)?;
        }

        let window_closed = !self.snd_wnd_edge.after(self.core.next_tx);
        if self.core.unsent() > 0 && window_closed && self.core.in_flight() == 0 {
            self.arm_persist(io);
        }
        Ok(())
    }

    fn fastest_rto(&self) -> SimTime {
        self.established
            .iter()
            .filter_map(|&i| self.subflow(i))
            .map(|sf| sf.rtt().rto())
            .min()
            .unwrap_or(self.cfg.tcp.init_rto)
    }

    /// DATA_FIN 在每条已建立子流上各发一份，任一存活路径都能把它送到
    fn transmit_data_fin(&mut self, io: &mut dyn Io) -> Result<()> {
        let Some(dsn) = self.data_fin_dsn else {
            return Ok(());
        };
        let carriers: Vec<SubflowId> = if self.established.is_empty() {
            self.signal_subflow().into_iter().collect()
        } else {
            self.established.iter().copied().collect()
        };
        for id in carriers {
            let ctx = self.ctx_for(id)?;
            if let Some(sf) = self.subflow_mut(id) {
                sf.send_data_fin(dsn, &ctx, io);
            }
        }
        self.cancel_timer(TimerKind::DataFinRetransmit, io);
        let after = self
            .fastest_rto()
            .saturating_mul(1u64 << self.data_fin_retries.min(10))
            .min(self.cfg.tcp.max_rto);
        let id = io.schedule(after, self.timer_key(TimerKind::DataFinRetransmit));
        self.timers.data_fin = Some(id);
        Ok(())
    }

    fn on_data_fin_timeout(&mut self, io: &mut dyn Io) -> Result<()> {
        self.timers.data_fin = None;
        if self.data_fin_acked || self.data_fin_dsn.is_none() {
            return Ok(());
        }
        // DATA_FIN 之前的数据还没全部确认时，对端无法确认 DATA_FIN；
        // 这些数据由子流自己的重传和重注入负责，不计入 DATA_FIN 的重传次数
        if self.data_fin_dsn != Some(self.core.first_unacked) {
            trace!(conn = self.id, data_una = self.core.first_unacked, "DATA_FIN 前仍有未确认数据");
            return self.transmit_data_fin(io);
        }
        self.data_fin_retries += 1;
        if self.data_fin_retries > self.cfg.tcp.data_retries {
            warn!(conn = self.id, "DATA_FIN 重传次数耗尽");
            self.abort(io)?;
            self.app_events.push_back(AppEvent::Reset);
            return Ok(());
        }
        debug!(conn = self.id, retries = self.data_fin_retries, "⏱️ DATA_FIN 重传");
        self.transmit_data_fin(io)
    }

    fn arm_persist(&mut self, io: &mut dyn Io) {
        if self.timers.persist.is_some() {
            return;
        }
        let after = self
            .cfg
            .tcp
            .persist_timeout
            .saturating_mul(1u64 << self.persist_backoff.min(6))
            .min(self.cfg.tcp.max_rto);
        let id = io.schedule(after, self.timer_key(TimerKind::Persist));
        self.timers.persist = Some(id);
    }

    /// 零窗口探测：无视连接级窗口映射一个字节
    fn on_persist(&mut self, io: &mut dyn Io) -> Result<()> {
        self.timers.persist = None;
        if self.core.unsent() == 0 || self.snd_wnd_edge.after(self.core.next_tx) {
            self.persist_backoff = 0;
            return Ok(());
        }
        let statuses = self.sendable_statuses();
        let next_dsn = self.core.next_tx;
        let input = SchedulerInput {
            unmapped: 1,
            conn_window: 1,
            segment_size: 1,
            next_dsn,
            subflows: &statuses,
        };
        if let Some(chunk) = self.scheduler.generate_mapping(&input) {
            debug!(conn = self.id, subflow = chunk.subflow, dsn = next_dsn, "零窗口探测");
            let sent = self.map_onto(chunk.subflow, next_dsn, 1, io)?;
            self.core.record_sent(next_dsn.wrapping_add(sent as u64));
        }
        self.persist_backoff += 1;
        self.arm_persist(io);
        Ok(())
    }
}
