//! The virtual processor scheduler.
//!
//! Strict priority scheduling over 64 levels with quantum decay. The ready
//! queue is one doubly-linked list per priority plus a population bitmap,
//! so selection is O(1): scan the bitmap from the top byte down and take
//! the head of the topmost populated list.
//!
//! The scheduler is a process-wide singleton, initialized once at boot and
//! never torn down. Its state is mediated by the preemption flag, not a
//! lock: every mutation happens with preemption disabled, which on this
//! single-CPU design means interrupts are masked.
//!
//! The quantum timer interrupt drives [`scheduler_on_end_of_quantum`]. The
//! expected interrupt glue sequence is:
//!
//! ```text
//! scheduler_enter_interrupt();
//! clock_on_tick();
//! scheduler_on_end_of_quantum();
//! scheduler_leave_interrupt();
//! scheduler_finish_quantum();   // performs the requested switch, if any
//! ```

use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use vireo_abi::errno::Errno;
use vireo_abi::time::{QUANTUMS_INFINITY, Quantums, TimeInterval};
use vireo_abi::vp::{
    VP_PRIORITY_APP_HIGHEST, VP_PRIORITY_HIGHEST, VP_PRIORITY_LOWEST, VP_PRIORITY_POP_BYTE_COUNT,
    VP_PRIORITY_COUNT, VpFlags, VpState, WakeReason,
};
use vireo_lib::cpu;
use vireo_lib::preempt::PreemptGuard;

use crate::clock;
use crate::sched::switch::switch_registers;
use crate::sched::vp::{
    Timeout, VirtualProcessor, VpClosure, VpList, vp_create, vp_destroy, vp_resume,
    vp_set_closure,
};

/// Voluntary context switches are enabled (the default). Cleared around
/// wake-ups that must not recurse into the switch path.
const SCHED_FLAG_VOLUNTARY_CSW_ENABLED: u8 = 0x01;

/// Finalizer backlog that wakes the scheduler VP for an immediate sweep.
const FINALIZE_NOW_THRESHOLD: usize = 4;

const IDLE_STACK_SIZE: usize = 4096;

/// A queue of waiting VPs, ordered by effective priority at enqueue time
/// (highest first, FIFO among equals). Owned by whichever primitive embeds
/// it; all manipulation goes through the scheduler.
pub struct WaitQueue {
    pub(crate) list: VpList,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            list: VpList::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn waiter_count(&self) -> usize {
        self.list.len()
    }
}

struct ReadyQueue {
    priority: [VpList; VP_PRIORITY_COUNT],
    populated: [u8; VP_PRIORITY_POP_BYTE_COUNT],
}

const EMPTY_LIST: VpList = VpList::new();

impl ReadyQueue {
    const fn new() -> Self {
        Self {
            priority: [EMPTY_LIST; VP_PRIORITY_COUNT],
            populated: [0; VP_PRIORITY_POP_BYTE_COUNT],
        }
    }
}

pub(crate) struct Scheduler {
    running: *mut VirtualProcessor,
    /// The VP most recently selected by the switch path. Introspection only.
    scheduled: *mut VirtualProcessor,
    boot_vp: *mut VirtualProcessor,
    idle_vp: *mut VirtualProcessor,
    ready_queue: ReadyQueue,
    flags: u8,
    /// Set by the end-of-quantum handler when a preemption is due; consumed
    /// by `scheduler_finish_quantum` at interrupt exit.
    csw_pending: bool,
    quantums_per_quarter_second: Quantums,
    /// Singly-linked, sorted ascending by deadline.
    timeout_queue: *mut Timeout,
    sleep_queue: WaitQueue,
    scheduler_wait_queue: WaitQueue,
    finalizer_queue: VpList,
}

impl Scheduler {
    const fn new() -> Self {
        Self {
            running: ptr::null_mut(),
            scheduled: ptr::null_mut(),
            boot_vp: ptr::null_mut(),
            idle_vp: ptr::null_mut(),
            ready_queue: ReadyQueue::new(),
            flags: SCHED_FLAG_VOLUNTARY_CSW_ENABLED,
            csw_pending: false,
            quantums_per_quarter_second: 25,
            timeout_queue: ptr::null_mut(),
            sleep_queue: WaitQueue::new(),
            scheduler_wait_queue: WaitQueue::new(),
            finalizer_queue: VpList::new(),
        }
    }
}

struct SchedCell(UnsafeCell<Scheduler>);

// SAFETY: all access happens with preemption disabled on a single CPU.
unsafe impl Sync for SchedCell {}

static SCHEDULER: SchedCell = SchedCell(UnsafeCell::new(Scheduler::new()));
static SCHEDULER_STARTED: AtomicBool = AtomicBool::new(false);
static INTERRUPT_NESTING: AtomicU32 = AtomicU32::new(0);

#[inline]
pub(crate) fn sp() -> *mut Scheduler {
    SCHEDULER.0.get()
}

/// Time-slice length implied by an effective priority.
#[inline]
pub(crate) fn quantum_allowance_for_priority(pri: i8) -> i8 {
    ((VP_PRIORITY_HIGHEST - pri) >> 3) + 1
}

// =============================================================================
// Preemption and cooperation control
// =============================================================================

/// Disable preemption. Returns an opaque prior state for
/// [`restore_preemption`]. Nestable.
#[inline]
pub fn disable_preemption() -> u64 {
    cpu::save_flags_cli()
}

/// Restore the preemption state saved by [`disable_preemption`].
#[inline]
pub fn restore_preemption(sps: u64) {
    cpu::restore_flags(sps);
}

/// Disable voluntary context switches. Preemption by interrupts is not
/// affected. Expects preemption disabled.
pub fn disable_cooperation() -> u8 {
    // SAFETY: preemption disabled per contract.
    unsafe {
        let s = sp();
        let old = (*s).flags;
        (*s).flags &= !SCHED_FLAG_VOLUNTARY_CSW_ENABLED;
        old
    }
}

/// Restore the cooperation state saved by [`disable_cooperation`].
pub fn restore_cooperation(scs: u8) {
    // SAFETY: preemption disabled per contract.
    unsafe {
        (*sp()).flags = scs;
    }
}

pub fn is_cooperation_enabled() -> bool {
    // SAFETY: single byte read.
    unsafe { (*sp()).flags & SCHED_FLAG_VOLUNTARY_CSW_ENABLED != 0 }
}

/// Interrupt glue: entered an interrupt handler.
pub fn scheduler_enter_interrupt() {
    INTERRUPT_NESTING.fetch_add(1, Ordering::Relaxed);
}

/// Interrupt glue: leaving an interrupt handler.
pub fn scheduler_leave_interrupt() {
    let prev = INTERRUPT_NESTING.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prev > 0, "interrupt nesting underflow");
}

#[inline]
pub fn in_interrupt_context() -> bool {
    INTERRUPT_NESTING.load(Ordering::Relaxed) > 0
}

// =============================================================================
// Boot
// =============================================================================

/// Initialize the scheduler around the calling context, which becomes the
/// boot VP. Must be called exactly once with preemption disabled, before
/// any other scheduler operation.
pub fn scheduler_init() -> Errno {
    let boot = match vp_create() {
        Ok(vp) => vp,
        Err(err) => return err,
    };

    // SAFETY: single-threaded boot, preemption disabled.
    unsafe {
        let s = sp();
        (*boot).suspension_count = 0;
        (*boot).priority = VP_PRIORITY_HIGHEST;
        (*boot).effective_priority = VP_PRIORITY_HIGHEST;
        (*boot).quantum_allowance = quantum_allowance_for_priority(VP_PRIORITY_HIGHEST);
        (*boot).state = VpState::Running;

        (*s).boot_vp = boot;
        (*s).running = boot;
        (*s).scheduled = boot;
        (*s).flags = SCHED_FLAG_VOLUNTARY_CSW_ENABLED;
    }

    vireo_lib::preempt::register_reschedule_callback(deferred_reschedule_callback);
    SCHEDULER_STARTED.store(true, Ordering::Release);

    // SAFETY: boot is valid; vpid is immutable.
    vireo_lib::klog_info!("SCHED: scheduler online, boot vp {}", unsafe {
        (*boot).vpid()
    });
    Errno::Ok
}

/// Finish scheduler bring-up once the clock is configured: compute the
/// boost granularity and start the idle VP at the reserved lowest priority.
pub fn scheduler_finish_boot() -> Errno {
    let idle = match vp_create() {
        Ok(vp) => vp,
        Err(err) => return err,
    };

    // SAFETY: single-threaded boot.
    unsafe {
        let s = sp();
        (*s).quantums_per_quarter_second = clock::quantums_per_quarter_second().max(1);

        (*idle).priority = VP_PRIORITY_LOWEST;
        (*idle).effective_priority = VP_PRIORITY_LOWEST;

        let err = vp_set_closure(
            idle,
            VpClosure::with_stack_sizes(idle_loop, ptr::null_mut(), IDLE_STACK_SIZE, 0),
        );
        if err != Errno::Ok {
            return err;
        }

        (*s).idle_vp = idle;
    }

    // SAFETY: idle is valid; vpid is immutable.
    vireo_lib::klog_info!("SCHED: idle vp {} ready", unsafe { (*idle).vpid() });
    vp_resume(idle, false)
}

extern "C" fn idle_loop(_context: *mut c_void) {
    loop {
        cpu::halt();
    }
}

pub fn scheduler_is_started() -> bool {
    SCHEDULER_STARTED.load(Ordering::Acquire)
}

/// Returns the currently running VP.
#[inline]
pub fn current_vp() -> *mut VirtualProcessor {
    // SAFETY: single pointer read; the running slot is only changed by the
    // switch path.
    unsafe { (*sp()).running }
}

pub(crate) fn sleep_queue() -> *mut WaitQueue {
    // SAFETY: the queue is embedded in the static scheduler.
    unsafe { &raw mut (*sp()).sleep_queue }
}

// =============================================================================
// Ready queue
// =============================================================================

/// Add `vp` to the ready queue at `effective_priority` and refill its time
/// slice. Expects preemption disabled.
///
/// # Safety
/// `vp` must be valid, unlinked and not suspended.
pub(crate) unsafe fn add_vp_locked(vp: *mut VirtualProcessor, effective_priority: i8) {
    let s = sp();

    debug_assert!((*vp).rewa_prev.is_null() && (*vp).rewa_next.is_null());
    debug_assert!((*vp).suspension_count == 0);

    (*vp).state = VpState::Ready;
    (*vp).effective_priority = effective_priority;
    (*vp).quantum_allowance = quantum_allowance_for_priority(effective_priority);
    (*vp).wait_start_time = clock::clock_current_quantums();

    let pri = effective_priority as usize;
    (*s).ready_queue.priority[pri].insert_last(vp);
    (*s).ready_queue.populated[pri >> 3] |= 1 << (pri & 7);
}

/// Take `vp` off the ready queue. Expects preemption disabled.
///
/// # Safety
/// `vp` must be on the ready queue.
pub(crate) unsafe fn remove_vp_locked(vp: *mut VirtualProcessor) {
    let s = sp();
    let pri = (*vp).effective_priority as usize;

    (*s).ready_queue.priority[pri].remove(vp);
    if (*s).ready_queue.priority[pri].is_empty() {
        (*s).ready_queue.populated[pri >> 3] &= !(1 << (pri & 7));
    }
}

/// The best VP to run next, or null if the ready queue is empty (only
/// possible before the idle VP exists or while it is running).
pub(crate) fn highest_priority_ready() -> *mut VirtualProcessor {
    // SAFETY: preemption disabled per contract of callers.
    unsafe {
        let s = sp();
        for byte_idx in (0..VP_PRIORITY_POP_BYTE_COUNT).rev() {
            let byte = (*s).ready_queue.populated[byte_idx];
            if byte != 0 {
                let bit = 7 - byte.leading_zeros() as usize;
                return (*s).ready_queue.priority[(byte_idx << 3) + bit].first;
            }
        }
        ptr::null_mut()
    }
}

// =============================================================================
// Timeouts
// =============================================================================

/// Arm `vp`'s timeout for `deadline` and link it into the timeout queue in
/// ascending deadline order.
pub(crate) unsafe fn arm_timeout(vp: *mut VirtualProcessor, deadline: TimeInterval) {
    let s = sp();

    (*vp).timeout.deadline =
        clock::quantums_from_interval(deadline, vireo_abi::time::QuantumRounding::AwayFromZero);
    (*vp).timeout.is_valid = true;

    let target = &raw mut (*vp).timeout;
    let mut prev: *mut Timeout = ptr::null_mut();
    let mut cur = (*s).timeout_queue;
    while !cur.is_null() {
        if (*cur).deadline > (*vp).timeout.deadline {
            break;
        }
        prev = cur;
        cur = (*cur).next;
    }

    (*target).next = cur;
    if prev.is_null() {
        (*s).timeout_queue = target;
    } else {
        (*prev).next = target;
    }
}

/// Cancel an armed timeout. Does nothing if none is armed.
pub(crate) unsafe fn cancel_timeout(vp: *mut VirtualProcessor) {
    if !(*vp).timeout.is_valid {
        return;
    }

    let s = sp();
    let target = &raw mut (*vp).timeout;

    let mut prev: *mut Timeout = ptr::null_mut();
    let mut cur = (*s).timeout_queue;
    while !cur.is_null() && cur != target {
        prev = cur;
        cur = (*cur).next;
    }
    if cur == target {
        if prev.is_null() {
            (*s).timeout_queue = (*target).next;
        } else {
            (*prev).next = (*target).next;
        }
    }

    (*target).next = ptr::null_mut();
    (*target).deadline = QUANTUMS_INFINITY;
    (*target).is_valid = false;
}

// =============================================================================
// Wait and wake-up
// =============================================================================

/// Park the calling VP on `queue` until it is woken or `deadline` passes.
///
/// Expects to be called with preemption disabled; preemption is
/// transparently re-enabled while some other VP runs and is disabled again
/// by the time this returns. A deadline at or before the current time
/// returns `TimedOut` without parking.
///
/// # Safety
/// `queue` must be a valid wait queue whose owner guarantees it outlives
/// the wait.
pub unsafe fn wait_on(
    queue: *mut WaitQueue,
    deadline: TimeInterval,
    interruptible: bool,
) -> Errno {
    let s = sp();
    let vp = (*s).running;

    debug_assert!((*vp).rewa_prev.is_null() && (*vp).rewa_next.is_null());
    debug_assert!((*vp).state != VpState::Waiting);

    if deadline < TimeInterval::INFINITY {
        if deadline <= clock::clock_current_time() {
            return Errno::TimedOut;
        }
        arm_timeout(vp, deadline);
    }

    wait_queue_insert_ordered(queue, vp);

    (*vp).state = VpState::Waiting;
    (*vp).waiting_on = queue;
    (*vp).wait_start_time = clock::clock_current_quantums();
    (*vp).wakeup_reason = WakeReason::None;
    if interruptible {
        (*vp).flags.insert(VpFlags::INTERRUPTIBLE_WAIT);
    } else {
        (*vp).flags.remove(VpFlags::INTERRUPTIBLE_WAIT);
    }

    switch_to_highest_ready();

    match (*vp).wakeup_reason {
        WakeReason::Interrupted => Errno::Intr,
        WakeReason::Timeout => Errno::TimedOut,
        _ => Errno::Ok,
    }
}

/// Insert `vp` into `queue` at its priority-ordered position: highest
/// effective priority first, FIFO among equals.
///
/// # Safety
/// `queue` must be valid; `vp` must be unlinked.
pub(crate) unsafe fn wait_queue_insert_ordered(queue: *mut WaitQueue, vp: *mut VirtualProcessor) {
    let mut prev: *mut VirtualProcessor = ptr::null_mut();
    let mut cur = (*queue).list.first;
    while !cur.is_null() {
        if (*cur).effective_priority < (*vp).effective_priority {
            break;
        }
        prev = cur;
        cur = (*cur).rewa_next;
    }
    (*queue).list.insert_after(vp, prev);
}

/// Finish a wait: unlink from wait queue and timeout queue, record the
/// reason. Does not schedule anything.
unsafe fn finish_wait(queue: *mut WaitQueue, vp: *mut VirtualProcessor, reason: WakeReason) {
    debug_assert!((*sp()).running != vp);

    if !queue.is_null() {
        (*queue).list.remove(vp);
    }
    cancel_timeout(vp);

    (*vp).waiting_on = ptr::null_mut();
    (*vp).wakeup_reason = reason;
    (*vp).flags.remove(VpFlags::INTERRUPTIBLE_WAIT);
}

/// Wake the specific VP `vp` waiting on `queue`. Expects preemption
/// disabled.
///
/// Returns `Busy` if `reason` is `Interrupted` but the VP's wait is not
/// interruptible. A wake-up never fails otherwise (though it may be a
/// no-op, e.g. when an interrupt handler targets the running VP).
///
/// # Safety
/// `vp` must be waiting on `queue` (or `queue` may be null if the VP holds
/// no queue reference).
pub unsafe fn wake_one(
    queue: *mut WaitQueue,
    vp: *mut VirtualProcessor,
    reason: WakeReason,
    allow_csw: bool,
) -> Errno {
    let s = sp();

    // An interrupt-triggered wake may race against the wait entry path and
    // target the running VP. The handler is expected to note the event in
    // its own state (e.g. a semaphore count); nothing to do here.
    if in_interrupt_context() && (*s).running == vp {
        return Errno::Ok;
    }

    if reason == WakeReason::Interrupted && !(*vp).flags.contains(VpFlags::INTERRUPTIBLE_WAIT) {
        return Errno::Busy;
    }

    finish_wait(queue, vp, reason);

    if (*vp).suspension_count == 0 {
        // Boost one step per quarter-second waited, capped at the highest
        // application priority. Scheduler VPs above the cap keep their
        // effective priority.
        let now = clock::clock_current_quantums();
        let qpq = (*s).quantums_per_quarter_second.max(1);
        let quarters = ((now - (*vp).wait_start_time) / qpq).max(0);
        let boosted = ((*vp).effective_priority as i32 + quarters.min(VP_PRIORITY_APP_HIGHEST as i32))
            .min(VP_PRIORITY_APP_HIGHEST as i32)
            .max((*vp).effective_priority as i32) as i8;

        add_vp_locked(vp, boosted);

        if allow_csw {
            maybe_switch_to(vp);
        }
    } else {
        // The wait ended while suspended: park off-queue until resumed.
        (*vp).state = VpState::Suspended;
    }

    Errno::Ok
}

/// Wake up to `count` waiters on `queue`, then consider a single voluntary
/// switch to the best woken candidate. Expects preemption disabled.
///
/// # Safety
/// `queue` must be valid.
pub unsafe fn wake_some(queue: *mut WaitQueue, count: usize, reason: WakeReason, allow_csw: bool) {
    let mut run_candidate: *mut VirtualProcessor = ptr::null_mut();
    let mut cur = (*queue).list.first;
    let mut woken = 0usize;

    while !cur.is_null() && woken < count {
        let next = (*cur).rewa_next;
        let err = wake_one(queue, cur, reason, false);
        if err == Errno::Ok && run_candidate.is_null() && (*cur).state == VpState::Ready {
            run_candidate = cur;
        }
        cur = next;
        woken += 1;
    }

    if allow_csw && !run_candidate.is_null() {
        maybe_switch_to(run_candidate);
    }
}

/// Wake every waiter on `queue` with reason `Finished`.
///
/// # Safety
/// `queue` must be valid.
pub unsafe fn wake_all(queue: *mut WaitQueue, allow_csw: bool) {
    wake_some(queue, usize::MAX, WakeReason::Finished, allow_csw);
}

/// Wake every waiter from an interrupt handler. Context switches are
/// deferred: the reschedule-pending flag is raised and serviced once the
/// last preemption guard drops.
///
/// # Safety
/// `queue` must be valid.
pub unsafe fn wake_all_from_interrupt(queue: *mut WaitQueue) {
    wake_some(queue, usize::MAX, WakeReason::Finished, false);
    PreemptGuard::set_reschedule_pending();
}

// =============================================================================
// Context switching
// =============================================================================

/// Forced switch to `vp`, which must be Ready and on the ready queue. The
/// caller has already parked the running VP on a wait queue, the finalizer
/// queue, or back on the ready queue.
///
/// # Safety
/// Preemption disabled; `vp` ready and enqueued.
pub(crate) unsafe fn switch_to(vp: *mut VirtualProcessor) {
    let s = sp();

    remove_vp_locked(vp);

    let prev = (*s).running;
    (*s).scheduled = vp;
    (*vp).state = VpState::Running;
    (*s).running = vp;

    let prev_ctx = if prev.is_null() {
        ptr::null_mut()
    } else {
        &raw mut (*prev).save_area
    };
    switch_registers(prev_ctx, &raw const (*vp).save_area);
}

/// Forced switch to the best ready VP.
///
/// # Safety
/// Preemption disabled; the ready queue must be non-empty (the idle VP
/// guarantees this after boot).
pub(crate) unsafe fn switch_to_highest_ready() {
    let vp = highest_priority_ready();
    assert!(!vp.is_null(), "ready queue empty; idle vp missing");
    switch_to(vp);
}

/// Voluntary switch to `vp` if it is the best ready candidate and at least
/// as urgent as the running VP. Only happens when cooperation is enabled
/// and we are not inside an interrupt handler.
///
/// # Safety
/// Preemption disabled.
pub(crate) unsafe fn maybe_switch_to(vp: *mut VirtualProcessor) {
    let s = sp();

    if (*vp).state != VpState::Ready || !is_cooperation_enabled() || in_interrupt_context() {
        return;
    }

    let best = highest_priority_ready();
    if best == vp && (*vp).effective_priority >= (*(*s).running).effective_priority {
        let cur = (*s).running;
        add_vp_locked(cur, (*cur).priority);
        switch_to(vp);
    }
}

/// Deferred reschedule, run when the outermost preemption guard drops with
/// a wake-up pending from interrupt context.
fn deferred_reschedule_callback() {
    if !scheduler_is_started() {
        return;
    }
    scheduler_reschedule();
}

/// Voluntary reschedule: yield to the best ready VP if it is at least as
/// urgent as the caller.
pub fn scheduler_reschedule() {
    let sps = disable_preemption();

    // SAFETY: preemption disabled.
    unsafe {
        let s = sp();
        if is_cooperation_enabled() && !in_interrupt_context() {
            let best = highest_priority_ready();
            if !best.is_null()
                && (*best).effective_priority >= (*(*s).running).effective_priority
            {
                let cur = (*s).running;
                add_vp_locked(cur, (*cur).priority);
                switch_to(best);
            }
        }
    }

    restore_preemption(sps);
}

// =============================================================================
// End of quantum
// =============================================================================

/// Quantum interrupt handler. Drains due timeouts, charges the running VP
/// for its quantum and, once the allowance is used up, decays its priority
/// and requests a preemption if a strictly better VP is ready.
pub fn scheduler_on_end_of_quantum() {
    // SAFETY: runs in the quantum interrupt with interrupts masked.
    unsafe {
        let s = sp();
        let now = clock::clock_current_quantums();

        // Move every VP whose timeout expired over to the ready queue.
        loop {
            let t = (*s).timeout_queue;
            if t.is_null() || (*t).deadline > now {
                break;
            }
            let vp = (*t).owner;
            let _ = wake_one((*vp).waiting_on, vp, WakeReason::Timeout, false);
            assert!(
                (*s).timeout_queue != t,
                "timeout queue did not advance; corrupt timeout record"
            );
        }

        let running = (*s).running;
        if running.is_null() {
            return;
        }

        (*running).quantum_allowance -= 1;
        if (*running).quantum_allowance > 0 {
            return;
        }

        // The slice expired. Decay one step, refill, and check whether
        // somebody more important is ready.
        (*running).effective_priority =
            ((*running).effective_priority - 1).max(VP_PRIORITY_LOWEST);
        (*running).quantum_allowance =
            quantum_allowance_for_priority((*running).effective_priority);

        let best = highest_priority_ready();
        if best.is_null() || (*best).effective_priority <= (*running).effective_priority {
            return;
        }

        (*s).csw_pending = true;
    }
}

/// True if the end-of-quantum handler requested a preemption that has not
/// been completed yet.
pub fn scheduler_preempt_pending() -> bool {
    // SAFETY: single byte read.
    unsafe { (*sp()).csw_pending }
}

/// Complete a preemption requested by [`scheduler_on_end_of_quantum`].
/// Called by the interrupt glue at interrupt exit with interrupts still
/// masked, after `scheduler_leave_interrupt`.
pub fn scheduler_finish_quantum() {
    // SAFETY: interrupts masked per contract.
    unsafe {
        let s = sp();
        if !(*s).csw_pending {
            return;
        }
        (*s).csw_pending = false;

        let running = (*s).running;
        if running.is_null() {
            return;
        }
        let best = highest_priority_ready();
        if best.is_null() || (*best).effective_priority <= (*running).effective_priority {
            return;
        }

        // The preempted VP re-enters the ready queue at its base priority.
        add_vp_locked(running, (*running).priority);
        switch_to(best);
    }
}

// =============================================================================
// Termination and finalization
// =============================================================================

/// Route the calling, already terminated VP to the finalizer queue and
/// switch away for good.
pub(crate) fn terminate_current_vp(vp: *mut VirtualProcessor) -> ! {
    // No need to save the prior preemption state: this VP never resumes.
    let _ = disable_preemption();

    // SAFETY: preemption disabled; vp is the caller.
    unsafe {
        let s = sp();
        debug_assert!((*s).running == vp);

        (*s).finalizer_queue.insert_last(vp);

        // A long corpse backlog wakes the scheduler VP for a sweep, if it
        // is idle. Either way, switch away; this VP is dead and must not
        // be re-queued.
        if (*s).finalizer_queue.len() >= FINALIZE_NOW_THRESHOLD
            && !(*s).scheduler_wait_queue.is_empty()
        {
            let boot = (*s).boot_vp;
            let _ = wake_one(
                &raw mut (*s).scheduler_wait_queue,
                boot,
                WakeReason::Interrupted,
                false,
            );
        }

        switch_to_highest_ready();
    }

    unreachable!("terminated vp resumed");
}

// =============================================================================
// Introspection
// =============================================================================

/// Snapshot of scheduler internals for diagnostics and tests.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerStats {
    pub running_vpid: u32,
    pub scheduled_vpid: u32,
    pub idle_vpid: u32,
    pub ready_count: usize,
    pub timeout_count: usize,
    pub finalizer_count: usize,
}

fn vpid_of(vp: *mut VirtualProcessor) -> u32 {
    if vp.is_null() {
        return vireo_abi::vp::INVALID_VPID;
    }
    // SAFETY: vpid is immutable after creation.
    unsafe { (*vp).vpid() }
}

pub fn scheduler_stats() -> SchedulerStats {
    let sps = disable_preemption();
    // SAFETY: preemption disabled.
    let stats = unsafe {
        let s = sp();

        let mut ready_count = 0;
        for list in (*s).ready_queue.priority.iter() {
            ready_count += list.len();
        }

        let mut timeout_count = 0;
        let mut t = (*s).timeout_queue;
        while !t.is_null() {
            timeout_count += 1;
            t = (*t).next;
        }

        SchedulerStats {
            running_vpid: vpid_of((*s).running),
            scheduled_vpid: vpid_of((*s).scheduled),
            idle_vpid: vpid_of((*s).idle_vp),
            ready_count,
            timeout_count,
            finalizer_count: (*s).finalizer_queue.len(),
        }
    };
    restore_preemption(sps);
    stats
}

/// True iff the ready-queue population bit for `pri` is set. Test hook;
/// expects preemption disabled.
pub(crate) fn ready_bitmap_bit(pri: i8) -> bool {
    // SAFETY: preemption disabled per contract.
    unsafe { (*sp()).ready_queue.populated[(pri as usize) >> 3] & (1 << (pri as usize & 7)) != 0 }
}

/// Length of the ready list at `pri`. Test hook; expects preemption
/// disabled.
pub(crate) fn ready_list_len(pri: i8) -> usize {
    // SAFETY: preemption disabled per contract.
    unsafe { (*sp()).ready_queue.priority[pri as usize].len() }
}

/// Head of the ready list at `pri`. Test hook; expects preemption
/// disabled.
pub(crate) fn ready_list_first(pri: i8) -> *mut VirtualProcessor {
    // SAFETY: preemption disabled per contract.
    unsafe { (*sp()).ready_queue.priority[pri as usize].first }
}

/// Number of armed timeout records. Test hook; expects preemption
/// disabled.
pub(crate) fn timeout_queue_len() -> usize {
    // SAFETY: preemption disabled per contract.
    unsafe {
        let mut n = 0;
        let mut t = (*sp()).timeout_queue;
        while !t.is_null() {
            n += 1;
            t = (*t).next;
        }
        n
    }
}

/// Scheduler chore loop. Runs on the boot VP after kernel bring-up; reaps
/// finalized VPs. Does not return.
pub fn scheduler_run() -> ! {
    loop {
        let sps = disable_preemption();
        // SAFETY: preemption disabled.
        let mut dead = unsafe {
            let s = sp();
            let first = (*s).finalizer_queue.first;
            (*s).finalizer_queue = VpList::new();
            first
        };
        restore_preemption(sps);

        let mut reaped = 0usize;
        while !dead.is_null() {
            // SAFETY: finalized VPs are unreachable from any other queue;
            // their links are only read here.
            unsafe {
                let next = (*dead).rewa_next;
                vp_destroy(dead);
                dead = next;
            }
            reaped += 1;
        }
        if reaped > 0 {
            vireo_lib::klog_debug!("SCHED: reaped {} finalized vps", reaped);
        }

        let deadline = clock::clock_current_time().add(TimeInterval::from_secs(1));
        let sps = disable_preemption();
        // SAFETY: preemption disabled; the queue is embedded in the static
        // scheduler.
        unsafe {
            let _ = wait_on(&raw mut (*sp()).scheduler_wait_queue, deadline, true);
        }
        restore_preemption(sps);
    }
}
