//! RTT 估计与 RTO 计算（RFC 6298）

use crate::sim::SimTime;

/// RTO 计算使用的时钟粒度
const CLOCK_GRANULARITY: SimTime = SimTime(1_000);
const MAX_BACKOFF: u32 = 16;

#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<SimTime>,
    rttvar: SimTime,
    rto: SimTime,
    backoff: u32,
    min_rto: SimTime,
    max_rto: SimTime,
    last_sample: Option<SimTime>,
}

impl RttEstimator {
    pub fn new(init_rto: SimTime, min_rto: SimTime, max_rto: SimTime) -> Self {
        Self {
            srtt: None,
            rttvar: SimTime::ZERO,
            rto: init_rto.clamp(min_rto, max_rto),
            backoff: 0,
            min_rto,
            max_rto,
            last_sample: None,
        }
    }

    /// 输入一个 RTT 样本，并清除退避
    pub fn sample(&mut self, rtt: SimTime) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = SimTime(rtt.0 / 2);
            }
            Some(srtt) => {
                let err = srtt.0.abs_diff(rtt.0);
                self.rttvar = SimTime((3 * self.rttvar.0 + err) / 4);
                self.srtt = Some(SimTime((7 * srtt.0 + rtt.0) / 8));
            }
        }
        let srtt = self.srtt.unwrap_or(rtt);
        let var = CLOCK_GRANULARITY.max(self.rttvar.saturating_mul(4));
        self.rto = srtt.saturating_add(var).clamp(self.min_rto, self.max_rto);
        self.backoff = 0;
        self.last_sample = Some(rtt);
    }

    /// 当前 RTO（含指数退避）
    pub fn rto(&self) -> SimTime {
        self.rto.saturating_mul(1u64 << self.backoff).min(self.max_rto)
    }

    /// 超时后退避
    pub fn back_off(&mut self) {
        self.backoff = (self.backoff + 1).min(MAX_BACKOFF);
    }

    pub fn backoff_count(&self) -> u32 {
        self.backoff
    }

    pub fn srtt(&self) -> Option<SimTime> {
        self.srtt
    }

    pub fn last_sample(&self) -> Option<SimTime> {
        self.last_sample
    }

    /// 平滑 RTT；无样本时退化为当前 RTO
    pub fn estimate(&self) -> SimTime {
        self.srtt.unwrap_or(self.rto)
    }
}
