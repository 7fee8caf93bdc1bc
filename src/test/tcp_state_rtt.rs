use crate::proto::tcp::{RttEstimator, TcpState};
use crate::sim::SimTime;

#[test]
fn active_close_walks_fin_wait_states() {
    let s = TcpState::Established;
    let s = s.on_close().expect("close");
    assert_eq!(s, TcpState::FinWait1);
    assert!(s.is_closing());
    assert!(!s.can_send());
    assert!(s.can_receive());

    let s = s.on_fin_acked().expect("fin acked");
    assert_eq!(s, TcpState::FinWait2);
    let s = s.on_fin_received().expect("peer fin");
    assert_eq!(s, TcpState::TimeWait);
    assert!(s.is_synchronized());
}

#[test]
fn passive_close_and_simultaneous_close() {
    let s = TcpState::Established.on_fin_received().expect("peer fin");
    assert_eq!(s, TcpState::CloseWait);
    assert!(s.can_send());
    assert!(!s.can_receive());
    let s = s.on_close().expect("close");
    assert_eq!(s, TcpState::LastAck);
    assert_eq!(s.on_fin_acked(), Some(TcpState::Closed));

    let s = TcpState::FinWait1.on_fin_received().expect("simultaneous");
    assert_eq!(s, TcpState::Closing);
    assert_eq!(s.on_fin_acked(), Some(TcpState::TimeWait));
}

#[test]
fn handshake_states_are_not_synchronized() {
    for s in [TcpState::Closed, TcpState::Listen, TcpState::SynSent, TcpState::SynRcvd] {
        assert!(!s.is_synchronized(), "{s}");
        assert!(!s.can_send(), "{s}");
    }
    assert_eq!(TcpState::SynSent.on_close(), None);
    assert_eq!(TcpState::Listen.on_fin_received(), None);
    assert_eq!(TcpState::FinWait1.to_string(), "FIN_WAIT_1");
}

#[test]
fn rto_uses_initial_value_until_first_sample() {
    let rtt = RttEstimator::new(
        SimTime::from_millis(200),
        SimTime::from_millis(10),
        SimTime::from_secs(60),
    );
    assert_eq!(rtt.rto(), SimTime::from_millis(200));
    assert_eq!(rtt.srtt(), None);
    assert_eq!(rtt.estimate(), SimTime::from_millis(200));
}

#[test]
fn rto_follows_rfc6298_after_samples() {
    let mut rtt = RttEstimator::new(
        SimTime::from_millis(200),
        SimTime::from_millis(1),
        SimTime::from_secs(60),
    );
    rtt.sample(SimTime::from_millis(40));
    assert_eq!(rtt.srtt(), Some(SimTime::from_millis(40)));
    // srtt + 4 * rttvar = 40 + 4 * 20
    assert_eq!(rtt.rto(), SimTime::from_millis(120));

    rtt.sample(SimTime::from_millis(40));
    // rttvar = 3/4 * 20 = 15
    assert_eq!(rtt.rto(), SimTime::from_millis(100));
    assert_eq!(rtt.last_sample(), Some(SimTime::from_millis(40)));
}

#[test]
fn rto_backoff_doubles_and_is_capped() {
    let mut rtt = RttEstimator::new(
        SimTime::from_millis(200),
        SimTime::from_millis(10),
        SimTime::from_secs(1),
    );
    rtt.back_off();
    assert_eq!(rtt.rto(), SimTime::from_millis(400));
    rtt.back_off();
    assert_eq!(rtt.rto(), SimTime::from_millis(800));
    rtt.back_off();
    assert_eq!(rtt.rto(), SimTime::from_secs(1));
    assert_eq!(rtt.backoff_count(), 3);

    // 新样本清除退避
    rtt.sample(SimTime::from_millis(50));
    assert_eq!(rtt.backoff_count(), 0);
    assert!(rtt.rto() < SimTime::from_millis(400));
}

#[test]
fn rto_is_clamped_to_minimum() {
    let mut rtt = RttEstimator::new(
        SimTime::from_millis(200),
        SimTime::from_millis(10),
        SimTime::from_secs(60),
    );
    rtt.sample(SimTime::from_micros(100));
    assert_eq!(rtt.rto(), SimTime::from_millis(10));
}
