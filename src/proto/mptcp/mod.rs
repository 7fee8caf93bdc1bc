//! MPTCP（RFC 6824）
//!
//! - `mapping`：DSN ↔ SSN 映射及其容器
//! - `options`：MPTCP 选项的线格式
//! - `crypto`：令牌/IDSN 派生与 MP_JOIN HMAC
//! - `subflow`：单条子流（TCP 状态机 + 映射）
//! - `meta`：连接级状态、重组与调度
//! - `scheduler` / `lia`：调度策略与耦合拥塞控制
//! - `stack`：连接分发与应用回调

mod config;
mod crypto;
mod error;
mod id_manager;
mod io;
mod lia;
mod mapping;
mod meta;
mod options;
mod scheduler;
mod socket;
mod stack;
mod subflow;

/// 连接（meta）编号
pub type ConnId = u64;
/// 子流在所属 meta 连接 arena 中的下标
pub type SubflowId = usize;

pub use config::MptcpConfig;
pub use crypto::{join_hmac, token_and_idsn, truncate_hmac};
pub use error::{ErrorKind, MptcpError, Result};
pub use id_manager::AddressIdManager;
pub use io::{Io, MptcpTimer, SimIo, TimerKey, TimerKind};
pub use lia::{CcInput, CongestionControlKind, PathSample, compute_alpha, increase_window, lia_increase, reno_increase};
pub use mapping::{Mapping, MappingContainer};
pub use meta::{KeyMaterial, MASTER_SUBFLOW, MetaConnection};
pub use options::{Dss, DssMapping, Join, MptcpOption, has_mptcp_option, parse_options};
pub use scheduler::{
    FastestRttScheduler, OwdAwareScheduler, RoundRobinScheduler, ScheduledChunk, Scheduler, SchedulerInput,
    SchedulerKind, SubflowStatus, create_scheduler,
};
pub use socket::{AppId, Application, Socket};
pub use stack::MptcpStack;
pub use subflow::{ConnCtx, Subflow, SubflowEvent, SubflowParams, SubflowRole};
