use crate::proto::mptcp::{
    FastestRttScheduler, OwdAwareScheduler, RoundRobinScheduler, ScheduledChunk, Scheduler, SchedulerInput,
    SchedulerKind, SubflowStatus, create_scheduler,
};
use crate::sim::SimTime;

fn sf(id: usize, rtt_ms: u64, window: u64) -> SubflowStatus {
    SubflowStatus {
        id,
        rtt: SimTime::from_millis(rtt_ms),
        owd: None,
        available_window: window,
    }
}

fn input(subflows: &[SubflowStatus]) -> SchedulerInput<'_> {
    SchedulerInput {
        unmapped: 10_000,
        conn_window: 100_000,
        segment_size: 1_400,
        next_dsn: 42,
        subflows,
    }
}

#[test]
fn fastest_rtt_prefers_lowest_rtt_with_window() {
    let subflows = [sf(0, 50, 10_000), sf(1, 10, 10_000)];
    let mut s = FastestRttScheduler;
    assert_eq!(
        s.generate_mapping(&input(&subflows)),
        Some(ScheduledChunk {
            subflow: 1,
            dsn: 42,
            length: 1_400,
        })
    );

    // 最快的子流窗口用尽时退到次快的
    let subflows = [sf(0, 50, 10_000), sf(1, 10, 0)];
    assert_eq!(s.generate_mapping(&input(&subflows)).map(|c| c.subflow), Some(0));
}

#[test]
fn fastest_rtt_breaks_ties_by_iteration_order() {
    let subflows = [sf(3, 20, 5_000), sf(1, 20, 5_000)];
    let mut s = FastestRttScheduler;
    assert_eq!(s.generate_mapping(&input(&subflows)).map(|c| c.subflow), Some(3));
}

#[test]
fn chunk_length_is_bounded_by_every_window() {
    let subflows = [sf(0, 10, 600)];
    let mut s = FastestRttScheduler;
    assert_eq!(s.generate_mapping(&input(&subflows)).map(|c| c.length), Some(600));

    let subflows = [sf(0, 10, 10_000)];
    let mut inp = input(&subflows);
    inp.conn_window = 300;
    assert_eq!(s.generate_mapping(&inp).map(|c| c.length), Some(300));
    inp.unmapped = 7;
    assert_eq!(s.generate_mapping(&inp).map(|c| c.length), Some(7));
}

#[test]
fn nothing_is_scheduled_without_data_window_or_subflows() {
    let subflows = [sf(0, 10, 10_000)];
    let mut s = RoundRobinScheduler::default();

    let mut inp = input(&subflows);
    inp.unmapped = 0;
    assert_eq!(s.generate_mapping(&inp), None);

    let mut inp = input(&subflows);
    inp.conn_window = 0;
    assert_eq!(s.generate_mapping(&inp), None);

    assert_eq!(s.generate_mapping(&input(&[])), None);

    let closed = [sf(0, 10, 0), sf(1, 10, 0)];
    assert_eq!(s.generate_mapping(&input(&closed)), None);
}

#[test]
fn round_robin_rotates_and_skips_full_subflows() {
    let subflows = [sf(0, 10, 10_000), sf(1, 50, 0), sf(2, 30, 10_000)];
    let mut s = RoundRobinScheduler::default();
    let picks: Vec<_> = (0..4)
        .filter_map(|_| s.generate_mapping(&input(&subflows)).map(|c| c.subflow))
        .collect();
    assert_eq!(picks, vec![0, 2, 0, 2]);
}

#[test]
fn owd_aware_falls_back_to_half_rtt() {
    let mut a = sf(0, 40, 10_000);
    a.owd = Some(SimTime::from_millis(5));
    let b = sf(1, 20, 10_000);
    let mut s = OwdAwareScheduler;
    // a: 5ms，b: 20/2 = 10ms
    assert_eq!(s.generate_mapping(&input(&[a, b])).map(|c| c.subflow), Some(0));

    a.owd = Some(SimTime::from_millis(15));
    assert_eq!(s.generate_mapping(&input(&[a, b])).map(|c| c.subflow), Some(1));
}

#[test]
fn create_scheduler_by_kind() {
    assert_eq!(create_scheduler(SchedulerKind::RoundRobin).name(), "round_robin");
    assert_eq!(create_scheduler(SchedulerKind::FastestRtt).name(), "fastest_rtt");
    assert_eq!(create_scheduler(SchedulerKind::OwdAware).name(), "owd_aware");
    assert_eq!(SchedulerKind::default(), SchedulerKind::FastestRtt);
}
