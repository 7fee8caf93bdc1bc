use crate::proto::mptcp::{CcInput, PathSample, compute_alpha, increase_window, lia_increase, reno_increase};

const MSS: u32 = 1_000;

#[test]
fn alpha_is_one_for_a_single_path() {
    let alpha = compute_alpha(&[PathSample {
        cwnd: 20_000,
        rtt_secs: 0.05,
    }])
    .expect("alpha");
    assert!((alpha - 1.0).abs() < 1e-9, "alpha = {alpha}");
}

#[test]
fn alpha_uses_each_paths_own_cwnd() {
    let paths = [
        PathSample {
            cwnd: 10_000,
            rtt_secs: 0.01,
        },
        PathSample {
            cwnd: 40_000,
            rtt_secs: 0.05,
        },
    ];
    // total · max(cwnd_i/rtt_i²) / (Σ cwnd_i/rtt_i)²
    let best = f64::max(10_000.0 / (0.01 * 0.01), 40_000.0 / (0.05 * 0.05));
    let sum = 10_000.0 / 0.01 + 40_000.0 / 0.05;
    let expected = 50_000.0 * best / (sum * sum);
    let alpha = compute_alpha(&paths).expect("alpha");
    assert!((alpha - expected).abs() < 1e-9, "{alpha} vs {expected}");
}

#[test]
fn alpha_for_two_equal_paths_is_one_half() {
    let p = PathSample {
        cwnd: 10_000,
        rtt_secs: 0.02,
    };
    let alpha = compute_alpha(&[p, p]).expect("alpha");
    assert!((alpha - 0.5).abs() < 1e-9, "alpha = {alpha}");
}

#[test]
fn paths_without_rtt_are_ignored() {
    let alpha = compute_alpha(&[
        PathSample {
            cwnd: 10_000,
            rtt_secs: 0.02,
        },
        PathSample {
            cwnd: 0,
            rtt_secs: 0.0,
        },
    ])
    .expect("alpha");
    assert!((alpha - 1.0).abs() < 1e-9);
}

#[test]
#[cfg_attr(debug_assertions, should_panic(expected = "protocol invariant"))]
fn alpha_with_zero_denominator_is_an_invariant_violation() {
    let r = compute_alpha(&[PathSample {
        cwnd: 10_000,
        rtt_secs: 0.0,
    }]);
    assert!(r.is_err());
}

#[test]
fn lia_increase_never_exceeds_reno() {
    // 耦合项更小
    assert_eq!(lia_increase(0.5, MSS, 10_000, 20_000, 1.0), 25);
    // 非耦合项更小：mss²/cwnd
    assert_eq!(lia_increase(10.0, MSS, 10_000, 20_000, 1.0), 100);
    assert_eq!(reno_increase(MSS, 10_000), 100);
    // alpha_scale 只缩放耦合项
    assert_eq!(lia_increase(0.5, MSS, 10_000, 20_000, 2.0), 12);
}

#[test]
fn slow_start_grows_by_acked_bytes_up_to_one_mss() {
    let cc = CcInput::Lia {
        alpha: 0.5,
        total_cwnd: 20_000,
        alpha_scale: 1.0,
    };
    assert_eq!(increase_window(cc, MSS, 10_000, 64_000, 500), 10_500);
    assert_eq!(increase_window(cc, MSS, 10_000, 64_000, 3_000), 11_000);
    assert_eq!(increase_window(CcInput::Uncoupled, MSS, 10_000, 64_000, 3_000), 11_000);
}

#[test]
fn congestion_avoidance_uses_coupled_or_reno_increase() {
    let cc = CcInput::Lia {
        alpha: 0.5,
        total_cwnd: 20_000,
        alpha_scale: 1.0,
    };
    assert_eq!(increase_window(cc, MSS, 10_000, 5_000, 1_000), 10_025);
    assert_eq!(increase_window(CcInput::Uncoupled, MSS, 10_000, 5_000, 1_000), 10_100);
}
