//! Synchronization primitive tests.
//!
//! Single-VP tests: everything here exercises the uncontended and
//! immediate-return paths, which never park the test runner.

use vireo_abi::errno::Errno;
use vireo_abi::time::TimeInterval;
use vireo_abi::vp::INVALID_VPID;
use vireo_lib::testing::TestResult;
use vireo_lib::{assert_eq_test, assert_test};

use crate::clock;
use crate::sched::vp::vp_current_vpid;
use crate::sync::condvar::ConditionVariable;
use crate::sync::mutex::Mutex;
use crate::sync::semaphore::Semaphore;
use crate::sync::uwq::{UserWaitQueue, UwqWakePolicy};

// =============================================================================
// Mutex
// =============================================================================

pub fn test_mutex_lock_records_owner() -> TestResult {
    let mutex = Mutex::new();

    assert_eq_test!(mutex.owner_vpid(), INVALID_VPID);
    mutex.lock();
    assert_eq_test!(mutex.owner_vpid(), vp_current_vpid());
    mutex.unlock();
    assert_eq_test!(mutex.owner_vpid(), INVALID_VPID);
    TestResult::Pass
}

pub fn test_mutex_try_lock() -> TestResult {
    let mutex = Mutex::new();

    assert_test!(mutex.try_lock());
    // Non-recursive: a second try on the same VP fails.
    assert_test!(!mutex.try_lock());
    mutex.unlock();
    assert_test!(mutex.try_lock());
    mutex.unlock();
    TestResult::Pass
}

pub fn test_mutex_relock_after_unlock() -> TestResult {
    let mutex = Mutex::new();

    for _ in 0..3 {
        mutex.lock();
        mutex.unlock();
    }
    TestResult::Pass
}

// =============================================================================
// Condition variable
// =============================================================================

pub fn test_condvar_signal_empty_is_noop() -> TestResult {
    let cv = ConditionVariable::new("test_cv");

    cv.signal();
    cv.broadcast();
    assert_test!(!cv.has_waiters());
    TestResult::Pass
}

pub fn test_condvar_signal_and_unlock_releases_mutex() -> TestResult {
    let mutex = Mutex::new();
    let cv = ConditionVariable::new("test_cv");

    mutex.lock();
    cv.signal_and_unlock(Some(&mutex));
    assert_eq_test!(mutex.owner_vpid(), INVALID_VPID);

    mutex.lock();
    cv.broadcast_and_unlock(Some(&mutex));
    assert_eq_test!(mutex.owner_vpid(), INVALID_VPID);
    TestResult::Pass
}

pub fn test_condvar_wait_past_deadline_times_out() -> TestResult {
    let mutex = Mutex::new();
    let cv = ConditionVariable::new("test_cv");

    let deadline = clock::clock_current_time().sub(TimeInterval::from_millis(1));

    mutex.lock();
    let err = cv.wait(&mutex, deadline);
    // The mutex is re-acquired on the way out, whatever the verdict.
    assert_eq_test!(mutex.owner_vpid(), vp_current_vpid());
    mutex.unlock();

    assert_eq_test!(err, Errno::TimedOut);
    TestResult::Pass
}

// =============================================================================
// Semaphore
// =============================================================================

pub fn test_semaphore_counts_permits() -> TestResult {
    let sem = Semaphore::new(2);

    assert_test!(sem.try_acquire());
    assert_test!(sem.try_acquire());
    assert_test!(!sem.try_acquire());
    assert_eq_test!(sem.count(), 0);

    sem.release();
    assert_eq_test!(sem.count(), 1);
    assert_test!(sem.try_acquire());
    TestResult::Pass
}

pub fn test_semaphore_acquire_fast_path() -> TestResult {
    let sem = Semaphore::new(1);

    assert_eq_test!(sem.acquire(TimeInterval::INFINITY), Errno::Ok);
    assert_eq_test!(sem.count(), 0);
    sem.release();
    TestResult::Pass
}

pub fn test_semaphore_timed_acquire_past_deadline() -> TestResult {
    let sem = Semaphore::new(0);

    let deadline = clock::clock_current_time().sub(TimeInterval::from_millis(1));
    assert_eq_test!(sem.acquire(deadline), Errno::TimedOut);
    assert_eq_test!(sem.count(), 0);
    TestResult::Pass
}

pub fn test_semaphore_release_from_interrupt_path() -> TestResult {
    let sem = Semaphore::new(0);

    // No waiters: the interrupt-safe release just banks the permit.
    sem.release_from_interrupt();
    assert_eq_test!(sem.count(), 1);
    assert_test!(sem.try_acquire());
    TestResult::Pass
}

// =============================================================================
// User wait queue
// =============================================================================

pub fn test_uwq_signalling_latch_consumed_by_wait() -> TestResult {
    let uwq = UserWaitQueue::new(true);

    uwq.wakeup(UwqWakePolicy::One, 0b101);
    uwq.wakeup(UwqWakePolicy::One, 0b010);
    assert_eq_test!(uwq.pending_sigs(), 0b111);

    // A latched mask satisfies the wait without parking.
    match uwq.wait() {
        Ok(sigs) => assert_eq_test!(sigs, 0b111),
        Err(err) => return vireo_lib::fail!("uwq wait: {:?}", err),
    }
    assert_eq_test!(uwq.pending_sigs(), 0);
    TestResult::Pass
}

pub fn test_uwq_wakeup_zero_mask_is_noop() -> TestResult {
    let uwq = UserWaitQueue::new(true);

    uwq.wakeup(UwqWakePolicy::All, 0);
    assert_eq_test!(uwq.pending_sigs(), 0);
    TestResult::Pass
}

pub fn test_uwq_plain_mode_never_latches() -> TestResult {
    let uwq = UserWaitQueue::new(false);

    uwq.wakeup(UwqWakePolicy::All, 0b11);
    assert_eq_test!(uwq.pending_sigs(), 0);
    TestResult::Pass
}

pub fn test_uwq_timed_wait_relative_past_deadline() -> TestResult {
    let uwq = UserWaitQueue::new(false);

    // A zero relative deadline is already in the past by the time the
    // scheduler checks it.
    match uwq.timed_wait(TimeInterval::ZERO, false) {
        Err(Errno::TimedOut) => TestResult::Pass,
        other => {
            vireo_lib::klog_info!("uwq timed_wait: unexpected {:?}", other);
            TestResult::Fail
        }
    }
}
