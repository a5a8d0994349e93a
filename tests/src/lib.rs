//! Test-suite aggregation.
//!
//! Collects the concurrency-core test suites into a registry and drives
//! them from kernel context once the scheduler, clock and VP pool are up.

#![no_std]

use spin::Mutex;

use vireo_lib::testing::{
    HARNESS_MAX_SUITES, TestConfig, TestRunSummary, TestSuiteDesc, TestSuiteResult,
    measure_elapsed_ms,
};
use vireo_lib::{klog_info, tsc};

pub const TESTS_MAX_SUITES: usize = HARNESS_MAX_SUITES;

struct Registry {
    suites: [Option<&'static TestSuiteDesc>; TESTS_MAX_SUITES],
    count: usize,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    suites: [None; TESTS_MAX_SUITES],
    count: 0,
});

pub fn tests_reset_registry() {
    let mut registry = REGISTRY.lock();
    registry.suites = [None; TESTS_MAX_SUITES];
    registry.count = 0;
}

pub fn tests_register_suite(desc: &'static TestSuiteDesc) -> i32 {
    if desc.run.is_none() {
        return -1;
    }

    let mut registry = REGISTRY.lock();
    if registry.count >= TESTS_MAX_SUITES {
        return -1;
    }
    let idx = registry.count;
    registry.suites[idx] = Some(desc);
    registry.count += 1;
    0
}

/// Register every built-in suite.
pub fn tests_register_system_suites() {
    suites::register_all();
}

/// Run all registered suites. Returns 0 when everything passed.
pub fn tests_run_all(config: &TestConfig, summary: &mut TestRunSummary) -> i32 {
    *summary = TestRunSummary::default();

    if !config.enabled {
        klog_info!("TESTS: harness disabled");
        return 0;
    }

    let (desc_list, desc_count) = {
        let registry = REGISTRY.lock();
        (registry.suites, registry.count)
    };

    klog_info!("TESTS: starting {} suites", desc_count);
    let start_cycles = tsc::rdtsc();

    for entry in desc_list.iter().take(desc_count) {
        let Some(desc) = entry else { continue };
        let Some(run) = desc.run else { continue };

        let suite_start = tsc::rdtsc();
        let mut res = TestSuiteResult::new(desc.name);
        let _ = run(config as *const TestConfig as *const (), &mut res);

        if config.timeout_ms != 0 {
            let elapsed = measure_elapsed_ms(suite_start, tsc::rdtsc());
            if elapsed > config.timeout_ms {
                res.timed_out = 1;
                res.failed = res.failed.saturating_add(1);
                klog_info!("TESTS: suite timeout exceeded");
            }
        }

        if summary.suite_count < TESTS_MAX_SUITES {
            summary.suites[summary.suite_count] = res;
            summary.suite_count += 1;
        }
        summary.add_suite_result(&res);

        klog_info!(
            "SUITE total={} pass={} fail={} elapsed={}ms",
            res.total,
            res.passed,
            res.failed,
            res.elapsed_ms,
        );
    }

    let overall_ms = measure_elapsed_ms(start_cycles, tsc::rdtsc());
    if overall_ms > summary.elapsed_ms {
        summary.elapsed_ms = overall_ms;
    }

    klog_info!(
        "TESTS SUMMARY: total={} passed={} failed={} elapsed_ms={}",
        summary.total_tests,
        summary.passed,
        summary.failed,
        summary.elapsed_ms,
    );

    if summary.failed == 0 { 0 } else { -1 }
}

mod suites {
    use super::tests_register_suite;
    use vireo_lib::define_test_suite;

    use vireo_core::clock_tests::{
        test_current_time_is_monotonic, test_delay_until_handles_past_deadline,
        test_delay_until_rejects_long_delays, test_interval_add_carries_nanos,
        test_interval_add_saturates_to_infinity, test_interval_add_saturates_to_neg_infinity,
        test_interval_constructors, test_interval_ordering, test_interval_sub_borrows_nanos,
        test_interval_sub_negative_result, test_quantum_conversion_infinity,
        test_quantum_rounding_modes, test_quantum_roundtrip_towards_zero_never_grows,
        test_tick_advances_quantum_counter,
    };

    use vireo_core::sched_tests::{
        test_add_vp_refills_quantum_allowance, test_cooperation_toggle_roundtrip,
        test_pool_reuses_relinquished_vp, test_preempt_disable_nests,
        test_preempt_disable_restore_roundtrip, test_quantum_allowance_formula,
        test_ready_bitmap_tracks_list_population, test_ready_queue_fifo_within_priority,
        test_ready_selection_prefers_higher_priority, test_sleep_short_interval_completes,
        test_sleep_zero_returns_immediately, test_timeout_queue_sorted_ascending,
        test_timeout_record_validity_bit, test_vp_created_suspended, test_vp_ids_are_unique,
        test_vp_set_priority_while_suspended_keeps_effective, test_vp_suspend_nesting,
        test_wait_on_past_deadline_returns_timeout_without_parking,
        test_wait_queue_orders_by_priority_fifo_among_equals,
    };

    use vireo_core::sync_tests::{
        test_condvar_signal_and_unlock_releases_mutex, test_condvar_signal_empty_is_noop,
        test_condvar_wait_past_deadline_times_out, test_mutex_lock_records_owner,
        test_mutex_relock_after_unlock, test_mutex_try_lock,
        test_semaphore_acquire_fast_path, test_semaphore_counts_permits,
        test_semaphore_release_from_interrupt_path, test_semaphore_timed_acquire_past_deadline,
        test_uwq_plain_mode_never_latches, test_uwq_signalling_latch_consumed_by_wait,
        test_uwq_timed_wait_relative_past_deadline, test_uwq_wakeup_zero_mask_is_noop,
    };

    use vireo_core::dispatch_tests::{
        test_coalesce_drops_duplicate_tag, test_create_idle_queue,
        test_create_validates_concurrency, test_dispatch_after_terminate_is_rejected,
        test_dispatch_periodically_rejects_zero_interval, test_dispatch_rejects_oversized_args,
        test_serial_queue_executes_in_submission_order, test_terminate_with_live_worker,
        test_timed_items_and_remove_by_tag, test_work_item_arg_copy_roundtrip,
        test_work_item_zero_args_alias_caller_pointer,
    };

    define_test_suite!(
        clock,
        [
            test_interval_add_carries_nanos,
            test_interval_sub_borrows_nanos,
            test_interval_sub_negative_result,
            test_interval_add_saturates_to_infinity,
            test_interval_add_saturates_to_neg_infinity,
            test_interval_ordering,
            test_interval_constructors,
            test_quantum_roundtrip_towards_zero_never_grows,
            test_quantum_rounding_modes,
            test_quantum_conversion_infinity,
            test_tick_advances_quantum_counter,
            test_current_time_is_monotonic,
            test_delay_until_rejects_long_delays,
            test_delay_until_handles_past_deadline,
        ]
    );

    define_test_suite!(
        sched,
        [
            test_vp_created_suspended,
            test_vp_ids_are_unique,
            test_vp_suspend_nesting,
            test_vp_set_priority_while_suspended_keeps_effective,
            test_ready_bitmap_tracks_list_population,
            test_ready_queue_fifo_within_priority,
            test_ready_selection_prefers_higher_priority,
            test_add_vp_refills_quantum_allowance,
            test_quantum_allowance_formula,
            test_wait_queue_orders_by_priority_fifo_among_equals,
            test_wait_on_past_deadline_returns_timeout_without_parking,
            test_timeout_queue_sorted_ascending,
            test_timeout_record_validity_bit,
            test_preempt_disable_restore_roundtrip,
            test_preempt_disable_nests,
            test_cooperation_toggle_roundtrip,
            test_sleep_zero_returns_immediately,
            test_sleep_short_interval_completes,
            test_pool_reuses_relinquished_vp,
        ]
    );

    define_test_suite!(
        sync,
        [
            test_mutex_lock_records_owner,
            test_mutex_try_lock,
            test_mutex_relock_after_unlock,
            test_condvar_signal_empty_is_noop,
            test_condvar_signal_and_unlock_releases_mutex,
            test_condvar_wait_past_deadline_times_out,
            test_semaphore_counts_permits,
            test_semaphore_acquire_fast_path,
            test_semaphore_timed_acquire_past_deadline,
            test_semaphore_release_from_interrupt_path,
            test_uwq_signalling_latch_consumed_by_wait,
            test_uwq_wakeup_zero_mask_is_noop,
            test_uwq_plain_mode_never_latches,
            test_uwq_timed_wait_relative_past_deadline,
        ]
    );

    define_test_suite!(
        dispatch,
        [
            test_create_validates_concurrency,
            test_create_idle_queue,
            test_dispatch_rejects_oversized_args,
            test_dispatch_periodically_rejects_zero_interval,
            test_timed_items_and_remove_by_tag,
            test_coalesce_drops_duplicate_tag,
            test_dispatch_after_terminate_is_rejected,
            test_work_item_arg_copy_roundtrip,
            test_work_item_zero_args_alias_caller_pointer,
            test_serial_queue_executes_in_submission_order,
            test_terminate_with_live_worker,
        ]
    );

    pub fn register_all() {
        let _ = tests_register_suite(&CLOCK_SUITE_DESC);
        let _ = tests_register_suite(&SCHED_SUITE_DESC);
        let _ = tests_register_suite(&SYNC_SUITE_DESC);
        let _ = tests_register_suite(&DISPATCH_SUITE_DESC);
    }
}
