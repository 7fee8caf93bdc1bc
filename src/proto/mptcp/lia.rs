//! 耦合拥塞控制：LIA（RFC 6356 "Linked Increases"）
//!
//! 慢启动与普通 TCP 相同；拥塞避免阶段每个 ACK 的增量为
//! `min(α·mss²/(α_scale·total_cwnd), mss²/cwnd)`，保证单个子流不比
//! 同路径上的单路径 TCP 更激进，且所有子流的总增长受 α 约束。

use serde::{Deserialize, Serialize};

use super::error::{Result, invariant_violation};

/// 子流使用的拥塞控制算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CongestionControlKind {
    /// 每个子流独立运行 Reno
    Uncoupled,
    /// RFC 6356 LIA
    #[default]
    Lia,
}

/// 计算 α 时的单个子流输入：(cwnd 字节, RTT 秒)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathSample {
    pub cwnd: u64,
    pub rtt_secs: f64,
}

/// α = total_cwnd · max_i(cwnd_i/rtt_i²) / (Σ_i cwnd_i/rtt_i)²
///
/// 每一项都使用该子流自己的 cwnd_i。分母为零（无有效 RTT/窗口）时 α 无定义，
/// 视为不变量违反。
pub fn compute_alpha(paths: &[PathSample]) -> Result<f64> {
    let total_cwnd: u64 = paths.iter().map(|p| p.cwnd).sum();
    let mut best = 0.0f64;
    let mut sum = 0.0f64;
    for p in paths {
        if p.rtt_secs <= 0.0 || !p.rtt_secs.is_finite() {
            continue;
        }
        let cwnd = p.cwnd as f64;
        best = best.max(cwnd / (p.rtt_secs * p.rtt_secs));
        sum += cwnd / p.rtt_secs;
    }
    let denom = sum * sum;
    if denom == 0.0 || !denom.is_finite() {
        return Err(invariant_violation(format!(
            "LIA alpha undefined: zero denominator over {} subflow(s)",
            paths.len()
        )));
    }
    Ok(total_cwnd as f64 * best / denom)
}

/// 拥塞避免阶段一个 ACK 带来的 cwnd 增量（字节，向下取整）
pub fn lia_increase(alpha: f64, mss: u32, cwnd: u64, total_cwnd: u64, alpha_scale: f64) -> u64 {
    let mss = mss as f64;
    let coupled = if total_cwnd == 0 {
        f64::INFINITY
    } else {
        alpha * mss * mss / (alpha_scale * total_cwnd as f64)
    };
    let uncoupled = mss * mss / (cwnd.max(1) as f64);
    coupled.min(uncoupled).max(0.0) as u64
}

/// Reno 拥塞避免增量：mss²/cwnd（至少 1 字节）
pub fn reno_increase(mss: u32, cwnd: u64) -> u64 {
    let mss = mss as u64;
    (mss.saturating_mul(mss) / cwnd.max(1)).max(1)
}

/// 一次窗口增长所需的连接级输入
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CcInput {
    Uncoupled,
    Lia {
        alpha: f64,
        total_cwnd: u64,
        alpha_scale: f64,
    },
}

/// 新 ACK 确认 `acked` 字节后的 cwnd 增长
pub fn increase_window(cc: CcInput, mss: u32, cwnd: u64, ssthresh: u64, acked: u64) -> u64 {
    if cwnd < ssthresh {
        // 慢启动：每个 ACK 至多增长一个 MSS
        return cwnd.saturating_add(acked.min(mss as u64));
    }
    let inc = match cc {
        CcInput::Uncoupled => reno_increase(mss, cwnd),
        CcInput::Lia {
            alpha,
            total_cwnd,
            alpha_scale,
        } => lia_increase(alpha, mss, cwnd, total_cwnd, alpha_scale),
    };
    cwnd.saturating_add(inc)
}
