//! Monotonic clock and time-interval tests.

use vireo_abi::time::{QUANTUMS_INFINITY, QuantumRounding, TimeInterval};
use vireo_lib::testing::TestResult;
use vireo_lib::{assert_eq_test, assert_test};

use crate::clock::{
    clock_current_quantums, clock_current_time, clock_delay_until, clock_on_tick,
    interval_from_quantums, quantums_from_interval,
};

pub fn test_interval_add_carries_nanos() -> TestResult {
    let a = TimeInterval::new(1, 800_000_000);
    let b = TimeInterval::new(0, 300_000_000);
    assert_eq_test!(a.add(b), TimeInterval::new(2, 100_000_000));
    TestResult::Pass
}

pub fn test_interval_sub_borrows_nanos() -> TestResult {
    let a = TimeInterval::new(2, 100_000_000);
    let b = TimeInterval::new(1, 300_000_000);
    assert_eq_test!(a.sub(b), TimeInterval::new(0, 800_000_000));
    TestResult::Pass
}

pub fn test_interval_sub_negative_result() -> TestResult {
    let a = TimeInterval::from_secs(1);
    let b = TimeInterval::from_secs(2);
    assert_eq_test!(a.sub(b), TimeInterval::new(-1, 0));
    assert_test!(a.sub(b).is_negative());
    TestResult::Pass
}

pub fn test_interval_add_saturates_to_infinity() -> TestResult {
    let a = TimeInterval::new(i32::MAX, 0);
    let b = TimeInterval::from_secs(1);
    assert_eq_test!(a.add(b), TimeInterval::INFINITY);
    TestResult::Pass
}

pub fn test_interval_add_saturates_to_neg_infinity() -> TestResult {
    let a = TimeInterval::new(i32::MIN, 0);
    let b = TimeInterval::from_secs(-1);
    assert_eq_test!(a.add(b), TimeInterval::NEG_INFINITY);
    TestResult::Pass
}

pub fn test_interval_ordering() -> TestResult {
    assert_test!(TimeInterval::ZERO < TimeInterval::from_millis(1));
    assert_test!(TimeInterval::from_millis(999) < TimeInterval::from_secs(1));
    assert_test!(TimeInterval::from_secs(5) < TimeInterval::INFINITY);
    assert_test!(TimeInterval::NEG_INFINITY < TimeInterval::ZERO);
    TestResult::Pass
}

pub fn test_interval_constructors() -> TestResult {
    assert_eq_test!(TimeInterval::from_millis(1500), TimeInterval::new(1, 500_000_000));
    assert_eq_test!(TimeInterval::from_micros(2_000_001), TimeInterval::new(2, 1000));
    assert_eq_test!(
        TimeInterval::from_nanos(3_000_000_007),
        TimeInterval::new(3, 7)
    );
    TestResult::Pass
}

pub fn test_quantum_roundtrip_towards_zero_never_grows() -> TestResult {
    let samples = [
        TimeInterval::from_millis(1),
        TimeInterval::from_millis(17),
        TimeInterval::from_millis(250),
        TimeInterval::new(3, 333_333_333),
    ];

    for ti in samples {
        let quants = quantums_from_interval(ti, QuantumRounding::TowardsZero);
        let back = interval_from_quantums(quants);
        assert_test!(back <= ti, "towards-zero round trip grew the interval");
    }
    TestResult::Pass
}

pub fn test_quantum_rounding_modes() -> TestResult {
    let tiny = TimeInterval::from_nanos(1);
    let towards = quantums_from_interval(tiny, QuantumRounding::TowardsZero);
    let away = quantums_from_interval(tiny, QuantumRounding::AwayFromZero);
    assert_eq_test!(towards, 0);
    assert_eq_test!(away, 1);
    TestResult::Pass
}

pub fn test_quantum_conversion_infinity() -> TestResult {
    assert_eq_test!(
        quantums_from_interval(TimeInterval::INFINITY, QuantumRounding::TowardsZero),
        QUANTUMS_INFINITY
    );
    assert_eq_test!(interval_from_quantums(QUANTUMS_INFINITY), TimeInterval::INFINITY);
    TestResult::Pass
}

pub fn test_tick_advances_quantum_counter() -> TestResult {
    let before = clock_current_quantums();
    clock_on_tick();
    assert_test!(clock_current_quantums() >= before + 1);
    TestResult::Pass
}

pub fn test_current_time_is_monotonic() -> TestResult {
    let t0 = clock_current_time();
    let t1 = clock_current_time();
    assert_test!(t1 >= t0);
    TestResult::Pass
}

pub fn test_delay_until_rejects_long_delays() -> TestResult {
    let deadline = clock_current_time().add(TimeInterval::from_secs(10));
    assert_test!(!clock_delay_until(deadline));
    TestResult::Pass
}

pub fn test_delay_until_handles_past_deadline() -> TestResult {
    let deadline = clock_current_time();
    assert_test!(clock_delay_until(deadline));
    TestResult::Pass
}
