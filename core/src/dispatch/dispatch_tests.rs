//! Dispatch queue tests.
//!
//! Structural tests use idle queues (min concurrency 0) and far-future
//! timers so no worker consumes the items under inspection. The end-to-end
//! tests exercise real workers and block the test runner on sync
//! dispatches.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use vireo_abi::dispatch::{DispatchOptions, DispatchQos, MAX_ARG_BYTES, QueueState};
use vireo_abi::errno::Errno;
use vireo_abi::time::TimeInterval;
use vireo_lib::testing::TestResult;
use vireo_lib::{assert_eq_test, assert_test, fail};

use crate::clock;
use crate::dispatch::item::{ARG_WORD_SIZE, WorkItem};
use crate::dispatch::queue::DispatchQueue;
use crate::sched::pool::pool_init;

extern "C" fn noop_closure(_context: *mut c_void, _arg: *mut c_void) {}

fn far_deadline() -> TimeInterval {
    clock::clock_current_time().add(TimeInterval::from_secs(600))
}

// =============================================================================
// Construction
// =============================================================================

pub fn test_create_validates_concurrency() -> TestResult {
    pool_init();

    assert_test!(DispatchQueue::create(0, 0, DispatchQos::Default, 0).is_err());
    assert_test!(DispatchQueue::create(-1, 1, DispatchQos::Default, 0).is_err());
    assert_test!(DispatchQueue::create(2, 1, DispatchQos::Default, 0).is_err());
    assert_test!(DispatchQueue::create(0, 1, DispatchQos::Default, 99).is_err());
    TestResult::Pass
}

pub fn test_create_idle_queue() -> TestResult {
    pool_init();

    let queue = match DispatchQueue::create(0, 1, DispatchQos::Default, 0) {
        Ok(queue) => queue,
        Err(err) => return fail!("create: {:?}", err),
    };

    assert_eq_test!(queue.state(), QueueState::Running);
    assert_eq_test!(queue.queued_count(), 0);
    assert_eq_test!(queue.available_concurrency(), 0);

    queue.terminate();
    queue.wait_for_termination();
    assert_eq_test!(queue.state(), QueueState::Terminated);
    TestResult::Pass
}

// =============================================================================
// Dispatch argument validation
// =============================================================================

pub fn test_dispatch_rejects_oversized_args() -> TestResult {
    pool_init();

    let queue = match DispatchQueue::create(0, 1, DispatchQos::Default, 0) {
        Ok(queue) => queue,
        Err(err) => return fail!("create: {:?}", err),
    };

    let args = [0u8; MAX_ARG_BYTES + 1];
    let err = queue.dispatch_closure(
        noop_closure,
        ptr::null_mut(),
        args.as_ptr(),
        args.len(),
        DispatchOptions::empty(),
        0,
    );
    assert_eq_test!(err, Errno::Inval);

    queue.terminate();
    queue.wait_for_termination();
    TestResult::Pass
}

pub fn test_dispatch_periodically_rejects_zero_interval() -> TestResult {
    pool_init();

    let queue = match DispatchQueue::create(0, 1, DispatchQos::Default, 0) {
        Ok(queue) => queue,
        Err(err) => return fail!("create: {:?}", err),
    };

    let err = queue.dispatch_periodically(
        far_deadline(),
        TimeInterval::ZERO,
        noop_closure,
        ptr::null_mut(),
        7,
    );
    assert_eq_test!(err, Errno::Inval);
    assert_eq_test!(queue.queued_count(), 0);

    queue.terminate();
    queue.wait_for_termination();
    TestResult::Pass
}

// =============================================================================
// Timed items, coalescing, removal by tag
// =============================================================================

pub fn test_timed_items_and_remove_by_tag() -> TestResult {
    pool_init();

    let queue = match DispatchQueue::create(0, 1, DispatchQos::Default, 0) {
        Ok(queue) => queue,
        Err(err) => return fail!("create: {:?}", err),
    };

    let base = far_deadline();
    for (tag, offset_secs) in [(1usize, 30), (2usize, 10), (3usize, 20)] {
        let err = queue.dispatch_after(
            base.add(TimeInterval::from_secs(offset_secs)),
            noop_closure,
            ptr::null_mut(),
            tag,
        );
        assert_eq_test!(err, Errno::Ok);
    }
    assert_eq_test!(queue.queued_count(), 3);

    assert_test!(queue.remove_by_tag(2));
    assert_eq_test!(queue.queued_count(), 2);
    assert_test!(!queue.remove_by_tag(2), "tag 2 removed twice");
    assert_test!(!queue.remove_by_tag(99));

    queue.terminate();
    queue.wait_for_termination();
    assert_eq_test!(queue.queued_count(), 0);
    TestResult::Pass
}

pub fn test_coalesce_drops_duplicate_tag() -> TestResult {
    pool_init();

    let queue = match DispatchQueue::create(0, 1, DispatchQos::Default, 0) {
        Ok(queue) => queue,
        Err(err) => return fail!("create: {:?}", err),
    };

    let err = queue.dispatch_timer(
        far_deadline(),
        TimeInterval::from_millis(50),
        noop_closure,
        ptr::null_mut(),
        ptr::null(),
        0,
        DispatchOptions::empty(),
        7,
    );
    assert_eq_test!(err, Errno::Ok);

    // Same tag with Coalesce: accepted but not enqueued.
    let err = queue.dispatch_timer(
        far_deadline(),
        TimeInterval::from_millis(50),
        noop_closure,
        ptr::null_mut(),
        ptr::null(),
        0,
        DispatchOptions::COALESCE,
        7,
    );
    assert_eq_test!(err, Errno::Ok);
    assert_eq_test!(queue.queued_count(), 1);

    // A different tag does enqueue.
    let err = queue.dispatch_timer(
        far_deadline(),
        TimeInterval::from_millis(50),
        noop_closure,
        ptr::null_mut(),
        ptr::null(),
        0,
        DispatchOptions::COALESCE,
        8,
    );
    assert_eq_test!(err, Errno::Ok);
    assert_eq_test!(queue.queued_count(), 2);

    queue.terminate();
    queue.wait_for_termination();
    TestResult::Pass
}

// =============================================================================
// Termination
// =============================================================================

pub fn test_dispatch_after_terminate_is_rejected() -> TestResult {
    pool_init();

    let queue = match DispatchQueue::create(0, 1, DispatchQos::Default, 0) {
        Ok(queue) => queue,
        Err(err) => return fail!("create: {:?}", err),
    };

    queue.terminate();
    // Terminate is idempotent.
    queue.terminate();

    assert_eq_test!(
        queue.dispatch_async(noop_closure, ptr::null_mut()),
        Errno::Terminated
    );
    assert_eq_test!(
        queue.dispatch_after(far_deadline(), noop_closure, ptr::null_mut(), 1),
        Errno::Terminated
    );

    queue.wait_for_termination();
    TestResult::Pass
}

// =============================================================================
// Work item pooling
// =============================================================================

pub fn test_work_item_arg_copy_roundtrip() -> TestResult {
    let item = match WorkItem::allocate() {
        Ok(item) => item,
        Err(err) => return fail!("allocate: {:?}", err),
    };

    let payload: [u8; 24] = [0xA5; 24];

    // SAFETY: item is private to this test.
    unsafe {
        assert_eq_test!(
            WorkItem::ensure_arg_capacity(item, payload.len()),
            Errno::Ok
        );
        assert_test!((*item).arg_capacity >= payload.len());
        assert_eq_test!((*item).arg_capacity % ARG_WORD_SIZE, 0);

        WorkItem::reinit(
            item,
            noop_closure,
            ptr::null_mut(),
            payload.as_ptr(),
            payload.len(),
            42,
        );
        assert_eq_test!((*item).tag, 42);
        assert_eq_test!((*item).arg as *const u8, (*item).arg_storage as *const u8);

        let copied = core::slice::from_raw_parts((*item).arg as *const u8, payload.len());
        assert_test!(copied == &payload[..], "argument bytes not copied");

        WorkItem::free(item);
    }
    TestResult::Pass
}

pub fn test_work_item_zero_args_alias_caller_pointer() -> TestResult {
    let item = match WorkItem::allocate() {
        Ok(item) => item,
        Err(err) => return fail!("allocate: {:?}", err),
    };

    let marker = 0xDEADusize as *mut c_void;

    // SAFETY: item is private to this test.
    unsafe {
        WorkItem::reinit(item, noop_closure, ptr::null_mut(), marker as *const u8, 0, 0);
        assert_eq_test!((*item).arg, marker);
        WorkItem::free(item);
    }
    TestResult::Pass
}

// =============================================================================
// End-to-end (live workers)
// =============================================================================

const SERIAL_SLOTS: usize = 5;

static SERIAL_NEXT: AtomicUsize = AtomicUsize::new(0);
static SERIAL_ORDER: [AtomicUsize; SERIAL_SLOTS] = [
    AtomicUsize::new(usize::MAX),
    AtomicUsize::new(usize::MAX),
    AtomicUsize::new(usize::MAX),
    AtomicUsize::new(usize::MAX),
    AtomicUsize::new(usize::MAX),
];

extern "C" fn record_order(context: *mut c_void, _arg: *mut c_void) {
    let value = context as usize;
    let slot = SERIAL_NEXT.fetch_add(1, Ordering::Relaxed);
    if slot < SERIAL_SLOTS {
        SERIAL_ORDER[slot].store(value, Ordering::Relaxed);
    }
}

/// Serial ordering: five async closures on a serial queue run in
/// submission order, observed after a sync barrier.
pub fn test_serial_queue_executes_in_submission_order() -> TestResult {
    pool_init();

    SERIAL_NEXT.store(0, Ordering::Relaxed);
    for slot in SERIAL_ORDER.iter() {
        slot.store(usize::MAX, Ordering::Relaxed);
    }

    let queue = match DispatchQueue::create(0, 1, DispatchQos::Default, 0) {
        Ok(queue) => queue,
        Err(err) => return fail!("create: {:?}", err),
    };

    for i in 0..SERIAL_SLOTS {
        let err = queue.dispatch_async(record_order, i as *mut c_void);
        assert_eq_test!(err, Errno::Ok);
    }

    // The barrier only returns after everything before it ran.
    assert_eq_test!(queue.dispatch_sync(noop_closure, ptr::null_mut()), Errno::Ok);

    for (expected, slot) in SERIAL_ORDER.iter().enumerate() {
        assert_eq_test!(slot.load(Ordering::Relaxed), expected);
    }

    queue.terminate();
    queue.wait_for_termination();
    TestResult::Pass
}

/// Termination of an empty queue with one live worker completes once the
/// worker notices the broadcast.
pub fn test_terminate_with_live_worker() -> TestResult {
    pool_init();

    let queue = match DispatchQueue::create(1, 1, DispatchQos::Default, 0) {
        Ok(queue) => queue,
        Err(err) => return fail!("create: {:?}", err),
    };
    assert_eq_test!(queue.available_concurrency(), 1);

    queue.terminate();
    queue.wait_for_termination();
    assert_eq_test!(queue.available_concurrency(), 0);
    assert_eq_test!(queue.state(), QueueState::Terminated);
    TestResult::Pass
}
