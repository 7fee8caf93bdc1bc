//! MPTCP 协议栈：连接分发与应用回调
//!
//! 每个网络一份。按四元组把段交给对应的 meta 连接；没有命中的 SYN 按
//! MP_CAPABLE（找监听套接字）或 MP_JOIN（按令牌找连接）处理，其余一律回 RST。
//!
//! 对外的 `send/recv/...` 在返回前派发应用回调；回调里通过 [`Socket`]
//! 调用的 `*_inner` 版本只排队事件，不会重入。

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddrV4;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, error, info, trace, warn};

use crate::net::{NetApi, NodeId};
use crate::proto::tcp::{SeqNum, SequenceSpace, TcpFlags, TcpHeader, TcpSegment, TcpState};
use crate::sim::Simulator;

use super::config::MptcpConfig;
use super::error::{ErrorKind, MptcpError, Result};
use super::io::{Io, SimIo, TimerKey};
use super::meta::{JoinRequest, KeyMaterial, MetaConnection, TupleChange};
use super::options::{Join, MptcpOption, parse_options};
use super::socket::{AppEvent, AppId, Application, Socket};
use super::{ConnId, SubflowId};

pub struct MptcpStack {
    cfg: MptcpConfig,
    metas: HashMap<ConnId, MetaConnection>,
    listeners: HashMap<SocketAddrV4, ConnId>,
    /// (本地, 远端) -> 子流
    tuples: HashMap<(SocketAddrV4, SocketAddrV4), (ConnId, SubflowId)>,
    /// (主机, 本端令牌) -> 连接，用于 MP_JOIN
    tokens: HashMap<(NodeId, u32), ConnId>,
    apps: Vec<Option<Box<dyn Application>>>,
    /// 密钥、ISN、MP_JOIN 随机数；按 `key_seed` 播种，仿真可复现
    keys: StdRng,
    next_conn: ConnId,
}

impl Default for MptcpStack {
    fn default() -> Self {
        Self::new(MptcpConfig::default())
    }
}

impl fmt::Debug for MptcpStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MptcpStack")
            .field("conns", &self.metas.len())
            .field("listeners", &self.listeners.len())
            .field("tuples", &self.tuples.len())
            .field("apps", &self.apps.len())
            .finish()
    }
}

impl MptcpStack {
    pub fn new(cfg: MptcpConfig) -> Self {
        Self {
            keys: StdRng::seed_from_u64(cfg.key_seed),
            cfg,
            metas: HashMap::new(),
            listeners: HashMap::new(),
            tuples: HashMap::new(),
            tokens: HashMap::new(),
            apps: Vec::new(),
            next_conn: 1,
        }
    }

    pub fn config(&self) -> &MptcpConfig {
        &self.cfg
    }

    pub fn register_app(&mut self, app: Box<dyn Application>) -> AppId {
        self.apps.push(Some(app));
        self.apps.len() - 1
    }

    /// 在 `host` 上创建一个未绑定的套接字
    pub fn create_socket(&mut self, host: NodeId, app: AppId) -> ConnId {
        let id = self.next_conn;
        self.next_conn += 1;
        self.metas
            .insert(id, MetaConnection::new(id, host, app, self.cfg.clone()));
        id
    }

    pub fn meta(&self, conn: ConnId) -> Option<&MetaConnection> {
        self.metas.get(&conn)
    }

    pub fn conns(&self) -> impl Iterator<Item = &MetaConnection> + '_ {
        self.metas.values()
    }

    pub fn bind(&mut self, conn: ConnId, addr: SocketAddrV4) -> Result<()> {
        if self.listeners.contains_key(&addr) {
            return Err(MptcpError::AddressInUse(addr));
        }
        self.metas
            .get_mut(&conn)
            .ok_or(MptcpError::UnknownConnection(conn))?
            .bind(addr)
    }

    pub fn listen(&mut self, conn: ConnId, sim: &mut Simulator, net: &mut dyn NetApi) -> Result<()> {
        self.with_meta(conn, sim, net, |m, io| m.listen(io))?;
        if let Some(addr) = self.metas.get(&conn).and_then(MetaConnection::bound_addr) {
            info!(conn, %addr, "👂 监听");
            self.listeners.insert(addr, conn);
        }
        Ok(())
    }

    pub fn connect(&mut self, conn: ConnId, remote: SocketAddrV4, sim: &mut Simulator, net: &mut dyn NetApi) -> Result<()> {
        let r = self.connect_inner(conn, remote, sim, net);
        self.dispatch(conn, sim, net);
        r
    }

    pub fn send(&mut self, conn: ConnId, data: &[u8], sim: &mut Simulator, net: &mut dyn NetApi) -> Result<usize> {
        let r = self.send_inner(conn, data, sim, net);
        self.dispatch(conn, sim, net);
        r
    }

    pub fn recv(&mut self, conn: ConnId, max: usize, sim: &mut Simulator, net: &mut dyn NetApi) -> Result<Vec<u8>> {
        let r = self.recv_inner(conn, max, sim, net);
        self.dispatch(conn, sim, net);
        r
    }

    pub fn close(&mut self, conn: ConnId, sim: &mut Simulator, net: &mut dyn NetApi) -> Result<()> {
        let r = self.close_inner(conn, sim, net);
        self.dispatch(conn, sim, net);
        r
    }

    pub fn connect_new_subflow(
        &mut self,
        conn: ConnId,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        sim: &mut Simulator,
        net: &mut dyn NetApi,
    ) -> Result<SubflowId> {
        let r = self.connect_new_subflow_inner(conn, local, remote, sim, net);
        self.dispatch(conn, sim, net);
        r
    }

    pub fn advertise_address(&mut self, conn: ConnId, addr: SocketAddrV4, sim: &mut Simulator, net: &mut dyn NetApi) -> Result<u8> {
        let r = self.advertise_address_inner(conn, addr, sim, net);
        self.dispatch(conn, sim, net);
        r
    }

    pub fn withdraw_address(&mut self, conn: ConnId, id: u8, sim: &mut Simulator, net: &mut dyn NetApi) -> Result<()> {
        let r = self.withdraw_address_inner(conn, id, sim, net);
        self.dispatch(conn, sim, net);
        r
    }

    // ---------------------------------------------------------------
    // 不派发回调的版本（供 Socket 使用）
    // ---------------------------------------------------------------

    pub(crate) fn connect_inner(&mut self, conn: ConnId, remote: SocketAddrV4, sim: &mut Simulator, net: &mut dyn NetApi) -> Result<()> {
        let meta = self.metas.get(&conn).ok_or(MptcpError::UnknownConnection(conn))?;
        let host = meta.host();
        let local = meta.bound_addr().ok_or(MptcpError::NotBound)?;
        if self.tuples.contains_key(&(local, remote)) {
            return Err(MptcpError::AddressInUse(local));
        }
        let key = self.fresh_key(host);
        let iss = SeqNum(self.keys.next_u32());
        info!(conn, %local, %remote, "🚀 发起 MPTCP 连接");
        self.with_meta(conn, sim, net, |m, io| m.connect(remote, key, iss, io))
            .map(|_| ())
    }

    pub(crate) fn send_inner(&mut self, conn: ConnId, data: &[u8], sim: &mut Simulator, net: &mut dyn NetApi) -> Result<usize> {
        self.with_meta(conn, sim, net, |m, io| m.send(data, io))
    }

    pub(crate) fn recv_inner(&mut self, conn: ConnId, max: usize, sim: &mut Simulator, net: &mut dyn NetApi) -> Result<Vec<u8>> {
        self.with_meta(conn, sim, net, |m, io| m.recv(max, io))
    }

    pub(crate) fn close_inner(&mut self, conn: ConnId, sim: &mut Simulator, net: &mut dyn NetApi) -> Result<()> {
        self.with_meta(conn, sim, net, |m, io| m.close(io))
    }

    pub(crate) fn connect_new_subflow_inner(
        &mut self,
        conn: ConnId,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        sim: &mut Simulator,
        net: &mut dyn NetApi,
    ) -> Result<SubflowId> {
        if self.tuples.contains_key(&(local, remote)) {
            return Err(MptcpError::AddressInUse(local));
        }
        let iss = SeqNum(self.keys.next_u32());
        let nonce = self.keys.next_u32();
        self.with_meta(conn, sim, net, |m, io| {
            m.connect_new_subflow(local, remote, iss, nonce, io)
        })
    }

    pub(crate) fn advertise_address_inner(
        &mut self,
        conn: ConnId,
        addr: SocketAddrV4,
        sim: &mut Simulator,
        net: &mut dyn NetApi,
    ) -> Result<u8> {
        self.with_meta(conn, sim, net, |m, io| m.advertise_address(addr, io))
    }

    pub(crate) fn withdraw_address_inner(&mut self, conn: ConnId, id: u8, sim: &mut Simulator, net: &mut dyn NetApi) -> Result<()> {
        self.with_meta(conn, sim, net, |m, io| m.withdraw_address(id, io))
    }

    // ---------------------------------------------------------------
    // 网络入口
    // ---------------------------------------------------------------

    /// 节点 `at` 收到一个 TCP 段
    #[tracing::instrument(skip_all, fields(node = %at, src = %seg.header.src, dst = %seg.header.dst))]
    pub fn on_segment(&mut self, at: NodeId, seg: TcpSegment, sim: &mut Simulator, net: &mut dyn NetApi) {
        let h = &seg.header;
        if let Some(&(conn, sf)) = self.tuples.get(&(h.dst, h.src)) {
            if let Err(e) = self.with_meta(conn, sim, net, |m, io| m.on_subflow_segment(sf, seg, io)) {
                warn!(conn, subflow = sf, error = %e, "处理段失败");
            }
            self.dispatch(conn, sim, net);
            return;
        }
        if h.flags.rst() {
            trace!("无主 RST，丢弃");
            return;
        }
        if !h.flags.syn() || h.flags.ack() {
            debug!(flags = %h.flags, "无主段，回 RST");
            send_rst(&seg, sim, net);
            return;
        }
        let opts = match parse_options(h) {
            Ok(opts) => opts,
            Err(e) => {
                warn!(error = %e, "SYN 选项非法，回 RST");
                send_rst(&seg, sim, net);
                return;
            }
        };
        for opt in &opts {
            match opt {
                MptcpOption::Capable {
                    sender_key,
                    receiver_key: None,
                } => {
                    let peer_key = *sender_key;
                    self.on_capable_syn(seg, peer_key, sim, net);
                    return;
                }
                MptcpOption::Join(Join::Syn {
                    token,
                    nonce,
                    addr_id,
                    backup,
                }) => {
                    let (token, nonce, addr_id, backup) = (*token, *nonce, *addr_id, *backup);
                    self.on_join_syn(at, seg, token, nonce, addr_id, backup, sim, net);
                    return;
                }
                _ => {}
            }
        }
        warn!("SYN 不含 MP_CAPABLE/MP_JOIN，回 RST");
        send_rst(&seg, sim, net);
    }

    fn on_capable_syn(&mut self, seg: TcpSegment, peer_key: u64, sim: &mut Simulator, net: &mut dyn NetApi) {
        let local = seg.header.dst;
        let listener = self
            .listeners
            .get(&local)
            .and_then(|id| self.metas.get(id))
            .filter(|m| m.state() == TcpState::Listen)
            .map(|m| (m.id(), m.host(), m.app()));
        let Some((listener, host, app)) = listener else {
            debug!(%local, "没有监听套接字，回 RST");
            send_rst(&seg, sim, net);
            return;
        };
        let conn = self.create_socket(host, app);
        let key = self.fresh_key(host);
        let iss = SeqNum(self.keys.next_u32());
        info!(listener, conn, remote = %seg.header.src, "收到 MP_CAPABLE SYN");
        let r = self.with_meta(conn, sim, net, |m, io| {
            m.accept_master(listener, &seg, local, peer_key, key, iss, io)
        });
        if let Err(e) = r {
            warn!(conn, error = %e, "被动打开失败");
        }
        self.dispatch(conn, sim, net);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_join_syn(
        &mut self,
        at: NodeId,
        seg: TcpSegment,
        token: u32,
        nonce: u32,
        addr_id: u8,
        backup: bool,
        sim: &mut Simulator,
        net: &mut dyn NetApi,
    ) {
        let Some(&conn) = self.tokens.get(&(at, token)) else {
            warn!(error = %MptcpError::UnknownToken(token), "MP_JOIN 令牌未知，回 RST");
            send_rst(&seg, sim, net);
            return;
        };
        let req = JoinRequest {
            local: seg.header.dst,
            peer_nonce: nonce,
            remote_id: addr_id,
            backup,
            local_nonce: self.keys.next_u32(),
            iss: SeqNum(self.keys.next_u32()),
        };
        let r = self.with_meta(conn, sim, net, |m, io| m.accept_join(&seg, req, io));
        if let Err(e) = r {
            warn!(conn, error = %e, "拒绝 MP_JOIN，回 RST");
            send_rst(&seg, sim, net);
        }
        self.dispatch(conn, sim, net);
    }

    /// 定时器到期
    pub fn on_timer(&mut self, key: TimerKey, sim: &mut Simulator, net: &mut dyn NetApi) {
        if !self.metas.contains_key(&key.conn) {
            trace!(?key, "连接已释放，忽略定时器");
            return;
        }
        if let Err(e) = self.with_meta(key.conn, sim, net, |m, io| m.on_timer(key, io)) {
            warn!(conn = key.conn, error = %e, "定时器处理失败");
        }
        self.dispatch(key.conn, sim, net);
    }

    // ---------------------------------------------------------------
    // 内部
    // ---------------------------------------------------------------

    /// 生成一个在本主机上令牌不冲突的密钥
    fn fresh_key(&mut self, host: NodeId) -> u64 {
        loop {
            let key = self.keys.next_u64();
            let token = KeyMaterial::from_key(key).token;
            if !self.tokens.contains_key(&(host, token)) {
                return key;
            }
            debug!(token, "令牌冲突，重新生成密钥");
        }
    }

    /// 在 meta 上执行一次操作；不变量违反时中止连接。之后同步分发表。
    fn with_meta<T>(
        &mut self,
        conn: ConnId,
        sim: &mut Simulator,
        net: &mut dyn NetApi,
        f: impl FnOnce(&mut MetaConnection, &mut dyn Io) -> Result<T>,
    ) -> Result<T> {
        let meta = self
            .metas
            .get_mut(&conn)
            .ok_or(MptcpError::UnknownConnection(conn))?;
        let mut io = SimIo::new(sim, net);
        let r = f(meta, &mut io);
        if let Err(e) = &r {
            if e.kind() == ErrorKind::ProtocolInvariantViolation {
                error!(conn, error = %e, "💥 协议不变量被破坏，中止连接");
                meta.fail(&mut io);
            }
        }
        self.sync_tables(conn);
        r
    }

    fn sync_tables(&mut self, conn: ConnId) {
        let Some(meta) = self.metas.get_mut(&conn) else {
            return;
        };
        for change in meta.take_tuple_changes() {
            match change {
                TupleChange::Added {
                    local,
                    remote,
                    subflow,
                } => {
                    self.tuples.insert((local, remote), (conn, subflow));
                }
                TupleChange::Removed { local, remote } => {
                    if self.tuples.get(&(local, remote)).is_some_and(|(c, _)| *c == conn) {
                        self.tuples.remove(&(local, remote));
                    }
                }
            }
        }
        if let Some(km) = meta.local_key() {
            self.tokens.entry((meta.host(), km.token)).or_insert(conn);
        }
    }

    /// 把排队的事件交给应用；连接结束后释放
    fn dispatch(&mut self, conn: ConnId, sim: &mut Simulator, net: &mut dyn NetApi) {
        loop {
            let Some(meta) = self.metas.get_mut(&conn) else {
                break;
            };
            let events = meta.take_app_events();
            if events.is_empty() {
                break;
            }
            let app_id = meta.app();
            for ev in events {
                let Some(mut app) = self.apps.get_mut(app_id).and_then(Option::take) else {
                    trace!(conn, ?ev, "没有应用，丢弃事件");
                    continue;
                };
                let mut sock = Socket {
                    stack: self,
                    sim: &mut *sim,
                    net: &mut *net,
                    conn,
                };
                match ev {
                    AppEvent::Connected => app.on_connected(&mut sock),
                    AppEvent::ConnectFailed => app.on_connect_failed(&mut sock),
                    AppEvent::Accepted { listener } => app.on_accept(listener, &mut sock),
                    AppEvent::DataAvailable => app.on_data_available(&mut sock),
                    AppEvent::SendPossible(space) => app.on_send_possible(&mut sock, space),
                    AppEvent::SubflowCreated(id) => app.on_subflow_created(&mut sock, id),
                    AppEvent::SubflowConnected(id) => app.on_subflow_connected(&mut sock, id),
                    AppEvent::FullyEstablished => app.on_fully_established(&mut sock),
                    AppEvent::PeerClosed => app.on_peer_close(&mut sock),
                    AppEvent::Closed => app.on_closed(&mut sock),
                    AppEvent::Reset => app.on_reset(&mut sock),
                }
                if let Some(slot) = self.apps.get_mut(app_id) {
                    *slot = Some(app);
                }
            }
        }
        self.gc(conn);
    }

    fn gc(&mut self, conn: ConnId) {
        if !self.metas.get(&conn).is_some_and(MetaConnection::is_finished) {
            return;
        }
        debug!(conn, "释放 meta 连接");
        self.metas.remove(&conn);
        self.tokens.retain(|_, c| *c != conn);
        self.listeners.retain(|_, c| *c != conn);
        self.tuples.retain(|_, (c, _)| *c != conn);
    }
}

/// 对无主段回 RST（RFC 793 的复位生成规则）
fn send_rst(seg: &TcpSegment, sim: &mut Simulator, net: &mut dyn NetApi) {
    let h = &seg.header;
    let rst = if h.flags.ack() {
        TcpHeader::new(h.dst, h.src, TcpFlags::RST, h.ack, SeqNum(0), 0)
    } else {
        let ack = h.seq.advance(seg.seq_len());
        TcpHeader::new(h.dst, h.src, TcpFlags::RST | TcpFlags::ACK, SeqNum(0), ack, 0)
    };
    net.send_segment(0, TcpSegment::new(rst, Vec::new()), sim);
}
