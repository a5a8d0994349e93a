//! Scheduler and virtual processor tests.
//!
//! These run inside the booted kernel on the test-runner VP. They poke
//! scheduler structures directly under disabled preemption and put
//! everything back before re-enabling it, so the live system never sees a
//! half-finished picture. VPs fabricated here never reach the ready queue
//! with an unseeded context.

use core::ptr;

use vireo_abi::errno::Errno;
use vireo_abi::time::TimeInterval;
use vireo_abi::vp::{INVALID_VPID, VpState};
use vireo_lib::cpu;
use vireo_lib::testing::TestResult;
use vireo_lib::{assert_eq_test, assert_test, fail};

use crate::clock;
use crate::sched::pool::{VpAcquisitionParams, pool_init, pool_shared};
use crate::sched::scheduler::{self, WaitQueue};
use crate::sched::vp::{
    Timeout, VirtualProcessor, vp_create, vp_destroy, vp_is_suspended, vp_resume, vp_set_priority,
    vp_sleep, vp_suspend,
};

/// A fabricated VP plus cleanup. The VP never runs; it only ever visits
/// scheduler data structures and is destroyed on drop.
struct VpFixture {
    vp: *mut VirtualProcessor,
}

impl VpFixture {
    fn new() -> Option<VpFixture> {
        match vp_create() {
            Ok(vp) => Some(VpFixture { vp }),
            Err(_) => None,
        }
    }
}

impl Drop for VpFixture {
    fn drop(&mut self) {
        // SAFETY: the fixture VP is suspended and unlinked by the time the
        // test returns.
        unsafe {
            (*self.vp).suspension_count = 1;
            (*self.vp).state = VpState::Suspended;
            vp_destroy(self.vp);
        }
    }
}

// =============================================================================
// VP lifecycle
// =============================================================================

pub fn test_vp_created_suspended() -> TestResult {
    let Some(fx) = VpFixture::new() else {
        return fail!("vp_create failed");
    };

    // SAFETY: the VP is private to this test.
    unsafe {
        assert_eq_test!((*fx.vp).state(), VpState::Suspended);
        assert_eq_test!((*fx.vp).suspension_count, 1);
        assert_test!((*fx.vp).vpid() != INVALID_VPID);
        assert_test!((*fx.vp).rewa_prev.is_null() && (*fx.vp).rewa_next.is_null());
    }
    TestResult::Pass
}

pub fn test_vp_ids_are_unique() -> TestResult {
    let Some(a) = VpFixture::new() else {
        return fail!("vp_create failed");
    };
    let Some(b) = VpFixture::new() else {
        return fail!("vp_create failed");
    };

    // SAFETY: both VPs are private to this test.
    unsafe {
        assert_test!((*a.vp).vpid() != (*b.vp).vpid());
    }
    TestResult::Pass
}

pub fn test_vp_suspend_nesting() -> TestResult {
    let Some(fx) = VpFixture::new() else {
        return fail!("vp_create failed");
    };

    assert_eq_test!(vp_suspend(fx.vp), Errno::Ok);
    assert_eq_test!(vp_suspend(fx.vp), Errno::Ok);
    // SAFETY: private VP.
    unsafe {
        assert_eq_test!((*fx.vp).suspension_count, 3);
    }

    assert_eq_test!(vp_resume(fx.vp, false), Errno::Ok);
    assert_test!(vp_is_suspended(fx.vp));
    assert_eq_test!(vp_resume(fx.vp, false), Errno::Ok);
    // SAFETY: private VP.
    unsafe {
        assert_eq_test!((*fx.vp).suspension_count, 1);
    }
    assert_test!(vp_is_suspended(fx.vp));

    TestResult::Pass
}

pub fn test_vp_set_priority_while_suspended_keeps_effective() -> TestResult {
    let Some(fx) = VpFixture::new() else {
        return fail!("vp_create failed");
    };

    // SAFETY: private VP.
    unsafe {
        let effective_before = (*fx.vp).effective_priority;
        vp_set_priority(fx.vp, 19);
        assert_eq_test!((*fx.vp).priority, 19);
        assert_eq_test!((*fx.vp).effective_priority, effective_before);
    }
    TestResult::Pass
}

// =============================================================================
// Ready queue
// =============================================================================

pub fn test_ready_bitmap_tracks_list_population() -> TestResult {
    let Some(fx) = VpFixture::new() else {
        return fail!("vp_create failed");
    };

    let sps = scheduler::disable_preemption();
    // SAFETY: preemption disabled; the VP is unlinked again before the
    // window closes.
    let (bit_set, len, bit_clear) = unsafe {
        (*fx.vp).suspension_count = 0;
        scheduler::add_vp_locked(fx.vp, 17);
        let bit_set = scheduler::ready_bitmap_bit(17);
        let len = scheduler::ready_list_len(17);
        scheduler::remove_vp_locked(fx.vp);
        let bit_clear = scheduler::ready_bitmap_bit(17);
        (*fx.vp).suspension_count = 1;
        (*fx.vp).state = VpState::Suspended;
        (bit_set, len, bit_clear)
    };
    scheduler::restore_preemption(sps);

    assert_test!(bit_set, "population bit not set after insert");
    assert_eq_test!(len, 1);
    assert_test!(!bit_clear, "population bit still set after removal");
    TestResult::Pass
}

pub fn test_ready_queue_fifo_within_priority() -> TestResult {
    let Some(a) = VpFixture::new() else {
        return fail!("vp_create failed");
    };
    let Some(b) = VpFixture::new() else {
        return fail!("vp_create failed");
    };

    let sps = scheduler::disable_preemption();
    // SAFETY: preemption disabled; both VPs unlinked before the window
    // closes.
    let (first, second) = unsafe {
        (*a.vp).suspension_count = 0;
        (*b.vp).suspension_count = 0;
        scheduler::add_vp_locked(a.vp, 18);
        scheduler::add_vp_locked(b.vp, 18);
        let first = scheduler::ready_list_first(18);
        scheduler::remove_vp_locked(a.vp);
        let second = scheduler::ready_list_first(18);
        scheduler::remove_vp_locked(b.vp);
        (*a.vp).suspension_count = 1;
        (*a.vp).state = VpState::Suspended;
        (*b.vp).suspension_count = 1;
        (*b.vp).state = VpState::Suspended;
        (first, second)
    };
    scheduler::restore_preemption(sps);

    assert_eq_test!(first, a.vp, "first-in vp is not at the head");
    assert_eq_test!(second, b.vp, "second vp did not move up");
    TestResult::Pass
}

pub fn test_ready_selection_prefers_higher_priority() -> TestResult {
    let Some(lo) = VpFixture::new() else {
        return fail!("vp_create failed");
    };
    let Some(hi) = VpFixture::new() else {
        return fail!("vp_create failed");
    };

    let sps = scheduler::disable_preemption();
    // SAFETY: preemption disabled; both VPs unlinked before the window
    // closes.
    let best = unsafe {
        (*lo.vp).suspension_count = 0;
        (*hi.vp).suspension_count = 0;
        scheduler::add_vp_locked(lo.vp, 17);
        scheduler::add_vp_locked(hi.vp, 19);
        let best = scheduler::highest_priority_ready();
        scheduler::remove_vp_locked(lo.vp);
        scheduler::remove_vp_locked(hi.vp);
        (*lo.vp).suspension_count = 1;
        (*lo.vp).state = VpState::Suspended;
        (*hi.vp).suspension_count = 1;
        (*hi.vp).state = VpState::Suspended;
        best
    };
    scheduler::restore_preemption(sps);

    // Something at least as urgent as our priority-19 VP must win; the
    // priority-17 VP certainly must not.
    assert_test!(best != lo.vp, "selection picked the lower priority vp");
    TestResult::Pass
}

pub fn test_add_vp_refills_quantum_allowance() -> TestResult {
    let Some(fx) = VpFixture::new() else {
        return fail!("vp_create failed");
    };

    let sps = scheduler::disable_preemption();
    // SAFETY: preemption disabled.
    let allowance = unsafe {
        (*fx.vp).suspension_count = 0;
        scheduler::add_vp_locked(fx.vp, 17);
        let allowance = (*fx.vp).quantum_allowance;
        scheduler::remove_vp_locked(fx.vp);
        (*fx.vp).suspension_count = 1;
        (*fx.vp).state = VpState::Suspended;
        allowance
    };
    scheduler::restore_preemption(sps);

    assert_eq_test!(allowance, scheduler::quantum_allowance_for_priority(17));
    TestResult::Pass
}

pub fn test_quantum_allowance_formula() -> TestResult {
    assert_eq_test!(scheduler::quantum_allowance_for_priority(63), 1);
    assert_eq_test!(scheduler::quantum_allowance_for_priority(42), 3);
    assert_eq_test!(scheduler::quantum_allowance_for_priority(0), 8);
    // Higher priority never means a longer slice.
    let mut prev = scheduler::quantum_allowance_for_priority(63);
    for pri in (0..63).rev() {
        let allowance = scheduler::quantum_allowance_for_priority(pri);
        assert_test!(allowance >= prev);
        prev = allowance;
    }
    TestResult::Pass
}

// =============================================================================
// Wait queues
// =============================================================================

pub fn test_wait_queue_orders_by_priority_fifo_among_equals() -> TestResult {
    let Some(a) = VpFixture::new() else {
        return fail!("vp_create failed");
    };
    let Some(b) = VpFixture::new() else {
        return fail!("vp_create failed");
    };
    let Some(c) = VpFixture::new() else {
        return fail!("vp_create failed");
    };

    let mut wq = WaitQueue::new();

    // SAFETY: the queue and VPs are private to this test.
    unsafe {
        (*a.vp).effective_priority = 10;
        (*b.vp).effective_priority = 30;
        (*c.vp).effective_priority = 30;

        scheduler::wait_queue_insert_ordered(&raw mut wq, a.vp);
        scheduler::wait_queue_insert_ordered(&raw mut wq, b.vp);
        scheduler::wait_queue_insert_ordered(&raw mut wq, c.vp);

        let first = wq.list.first;
        let second = (*first).rewa_next;
        let third = (*second).rewa_next;

        let ordered = first == b.vp && second == c.vp && third == a.vp;

        wq.list.remove(a.vp);
        wq.list.remove(b.vp);
        wq.list.remove(c.vp);

        assert_test!(ordered, "wait queue not (30-fifo, 30-fifo, 10)");
        assert_test!(wq.is_empty());
    }
    TestResult::Pass
}

pub fn test_wait_on_past_deadline_returns_timeout_without_parking() -> TestResult {
    let mut wq = WaitQueue::new();
    let deadline = clock::clock_current_time().sub(TimeInterval::from_millis(1));

    let sps = scheduler::disable_preemption();
    // SAFETY: preemption disabled; a past deadline returns before any
    // queue linkage happens.
    let err = unsafe { scheduler::wait_on(&raw mut wq, deadline, false) };
    scheduler::restore_preemption(sps);

    assert_eq_test!(err, Errno::TimedOut);
    assert_test!(wq.is_empty(), "vp was parked despite a past deadline");
    TestResult::Pass
}

// =============================================================================
// Timeout queue
// =============================================================================

/// Walk `next` links; true if `to` shows up somewhere after `from`.
unsafe fn timeout_reaches(from: *const Timeout, to: *const Timeout) -> bool {
    let mut cur = (*from).next as *const Timeout;
    while !cur.is_null() {
        if cur == to {
            return true;
        }
        cur = (*cur).next;
    }
    false
}

pub fn test_timeout_queue_sorted_ascending() -> TestResult {
    let Some(a) = VpFixture::new() else {
        return fail!("vp_create failed");
    };
    let Some(b) = VpFixture::new() else {
        return fail!("vp_create failed");
    };
    let Some(c) = VpFixture::new() else {
        return fail!("vp_create failed");
    };

    let now = clock::clock_current_time();

    let sps = scheduler::disable_preemption();
    // SAFETY: preemption disabled; all three timeouts are cancelled before
    // the window closes.
    let ordered = unsafe {
        let len_before = scheduler::timeout_queue_len();

        scheduler::arm_timeout(a.vp, now.add(TimeInterval::from_secs(20)));
        scheduler::arm_timeout(b.vp, now.add(TimeInterval::from_secs(10)));
        scheduler::arm_timeout(c.vp, now.add(TimeInterval::from_secs(30)));

        let len_armed = scheduler::timeout_queue_len();

        let b_then_a = timeout_reaches(&raw const (*b.vp).timeout, &raw const (*a.vp).timeout);
        let a_then_c = timeout_reaches(&raw const (*a.vp).timeout, &raw const (*c.vp).timeout);

        scheduler::cancel_timeout(b.vp);
        let len_cancelled = scheduler::timeout_queue_len();

        scheduler::cancel_timeout(a.vp);
        scheduler::cancel_timeout(c.vp);
        // Cancel is idempotent.
        scheduler::cancel_timeout(c.vp);
        let len_after = scheduler::timeout_queue_len();

        b_then_a
            && a_then_c
            && len_armed == len_before + 3
            && len_cancelled == len_before + 2
            && len_after == len_before
    };
    scheduler::restore_preemption(sps);

    assert_test!(ordered, "timeout queue ordering or accounting broken");
    TestResult::Pass
}

pub fn test_timeout_record_validity_bit() -> TestResult {
    let Some(fx) = VpFixture::new() else {
        return fail!("vp_create failed");
    };

    let now = clock::clock_current_time();

    let sps = scheduler::disable_preemption();
    // SAFETY: preemption disabled.
    let (valid_armed, valid_cancelled) = unsafe {
        scheduler::arm_timeout(fx.vp, now.add(TimeInterval::from_secs(5)));
        let valid_armed = (*fx.vp).timeout.is_valid;
        scheduler::cancel_timeout(fx.vp);
        let valid_cancelled = (*fx.vp).timeout.is_valid;
        (valid_armed, valid_cancelled)
    };
    scheduler::restore_preemption(sps);

    assert_test!(valid_armed);
    assert_test!(!valid_cancelled);
    TestResult::Pass
}

// =============================================================================
// Preemption and cooperation
// =============================================================================

pub fn test_preempt_disable_restore_roundtrip() -> TestResult {
    let before = cpu::interrupts_enabled();
    let sps = scheduler::disable_preemption();
    let during = cpu::interrupts_enabled();
    scheduler::restore_preemption(sps);
    let after = cpu::interrupts_enabled();

    assert_test!(!during, "preemption still enabled inside the window");
    assert_eq_test!(after, before, "preemption state not restored");
    TestResult::Pass
}

pub fn test_preempt_disable_nests() -> TestResult {
    let before = cpu::interrupts_enabled();
    let outer = scheduler::disable_preemption();
    let inner = scheduler::disable_preemption();
    scheduler::restore_preemption(inner);
    assert_test!(!cpu::interrupts_enabled(), "inner restore leaked");
    scheduler::restore_preemption(outer);
    assert_eq_test!(cpu::interrupts_enabled(), before);
    TestResult::Pass
}

pub fn test_cooperation_toggle_roundtrip() -> TestResult {
    let sps = scheduler::disable_preemption();
    let before = scheduler::is_cooperation_enabled();

    let scs = scheduler::disable_cooperation();
    let during = scheduler::is_cooperation_enabled();
    scheduler::restore_cooperation(scs);
    let after = scheduler::is_cooperation_enabled();

    scheduler::restore_preemption(sps);

    assert_test!(!during, "cooperation still enabled inside the window");
    assert_eq_test!(after, before);
    TestResult::Pass
}

// =============================================================================
// Sleep
// =============================================================================

pub fn test_sleep_zero_returns_immediately() -> TestResult {
    assert_eq_test!(vp_sleep(TimeInterval::ZERO), Errno::Ok);
    assert_eq_test!(vp_sleep(TimeInterval::from_secs(-1)), Errno::Ok);
    TestResult::Pass
}

pub fn test_sleep_short_interval_completes() -> TestResult {
    let t0 = clock::clock_current_time();
    assert_eq_test!(vp_sleep(TimeInterval::from_millis(20)), Errno::Ok);
    let t1 = clock::clock_current_time();
    assert_test!(t1.sub(t0) >= TimeInterval::from_millis(20));
    TestResult::Pass
}

// =============================================================================
// Pool
// =============================================================================

extern "C" fn pool_test_entry(_context: *mut core::ffi::c_void) {
    // Runs once and relinquishes via the entry trampoline.
}

pub fn test_pool_reuses_relinquished_vp() -> TestResult {
    pool_init();

    let (_, reuse_before) = pool_shared().counts();

    let params = VpAcquisitionParams {
        func: pool_test_entry,
        context: ptr::null_mut(),
        kernel_stack_size: 8192,
        user_stack_size: 0,
        priority: 40,
    };
    let vp = match pool_shared().acquire(params) {
        Ok(vp) => vp,
        Err(err) => return fail!("pool acquire: {:?}", err),
    };

    assert_test!(vp_is_suspended(vp), "acquired vp must come back suspended");
    assert_eq_test!(vp_resume(vp, false), Errno::Ok);

    // The worker runs at priority 40 as soon as we sleep, finishes its
    // no-op closure and relinquishes itself into the reuse cache.
    for _ in 0..200 {
        let _ = vp_sleep(TimeInterval::from_millis(2));
        let (_, reuse) = pool_shared().counts();
        if reuse > reuse_before {
            break;
        }
    }

    let (_, reuse_after) = pool_shared().counts();
    assert_test!(
        reuse_after > reuse_before,
        "relinquished vp never reached the reuse cache"
    );
    TestResult::Pass
}
