//! Virtual processors: execution stacks, the VP control block and its
//! lifecycle.
//!
//! A virtual processor is created suspended (count 1) and runs only once
//! explicitly resumed. `vp_set_closure` seeds the saved register context so
//! that the first resume enters the entry trampoline, which calls the
//! closure and then relinquishes the VP back to the pool.
//!
//! Ownership: the pool owns every VP it created. The scheduler's queues
//! (ready, wait, finalizer) and the dispatch queues only hold borrowed
//! references, valid because a VP sits on at most one list at a time.

use core::alloc::Layout;
use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use vireo_abi::errno::Errno;
use vireo_abi::time::{QUANTUMS_INFINITY, Quantums, TimeInterval};
use vireo_abi::vp::{
    VP_DEFAULT_KERNEL_STACK_SIZE, VP_DEFAULT_USER_STACK_SIZE, VP_MAX_SUSPENSION_COUNT,
    VP_MIN_KERNEL_STACK_SIZE, VP_PRIORITY_NORMAL, VpFlags, VpId, VpState, WakeReason,
};

use crate::clock;
use crate::sched::scheduler::{self, WaitQueue};
use crate::sched::switch::{EntryFn, SwitchContext, vp_entry_trampoline};

pub const STACK_ALIGNMENT: usize = 16;

// =============================================================================
// ExecutionStack
// =============================================================================

/// A contiguous stack region. The initial top of stack is `base + size`.
pub struct ExecutionStack {
    base: *mut u8,
    size: usize,
}

impl ExecutionStack {
    pub const fn empty() -> Self {
        Self {
            base: ptr::null_mut(),
            size: 0,
        }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The address just past the last byte; stacks grow down from here.
    #[inline]
    pub fn initial_top(&self) -> *mut u8 {
        // SAFETY: base + size is one-past-the-end of the allocation.
        unsafe { self.base.add(self.size) }
    }

    /// Resize the stack. The old contents are not preserved. Only legal
    /// while the owning VP is suspended.
    pub fn set_max_size(&mut self, size: usize) -> Result<(), Errno> {
        let new_size = size.next_multiple_of(STACK_ALIGNMENT);
        if self.size == new_size {
            return Ok(());
        }

        self.destroy();

        if new_size == 0 {
            return Ok(());
        }

        // SAFETY: new_size is non-zero and alignment is a power of two.
        let layout = Layout::from_size_align(new_size, STACK_ALIGNMENT)
            .map_err(|_| Errno::Inval)?;
        let base = unsafe { alloc::alloc::alloc(layout) };
        if base.is_null() {
            return Err(Errno::NoMem);
        }

        self.base = base;
        self.size = new_size;
        Ok(())
    }

    pub fn destroy(&mut self) {
        if !self.base.is_null() {
            // SAFETY: base was allocated with exactly this layout.
            unsafe {
                let layout = Layout::from_size_align_unchecked(self.size, STACK_ALIGNMENT);
                alloc::alloc::dealloc(self.base, layout);
            }
        }
        self.base = ptr::null_mut();
        self.size = 0;
    }
}

// =============================================================================
// Closures
// =============================================================================

/// What a virtual processor runs once resumed: an entry function, its
/// context argument and the stack sizes to provision.
#[derive(Clone, Copy)]
pub struct VpClosure {
    pub func: EntryFn,
    pub context: *mut c_void,
    pub kernel_stack_size: usize,
    pub user_stack_size: usize,
}

impl VpClosure {
    pub fn new(func: EntryFn, context: *mut c_void) -> Self {
        Self {
            func,
            context,
            kernel_stack_size: VP_DEFAULT_KERNEL_STACK_SIZE,
            user_stack_size: VP_DEFAULT_USER_STACK_SIZE,
        }
    }

    pub fn with_stack_sizes(
        func: EntryFn,
        context: *mut c_void,
        kernel_stack_size: usize,
        user_stack_size: usize,
    ) -> Self {
        Self {
            func,
            context,
            kernel_stack_size,
            user_stack_size,
        }
    }
}

// =============================================================================
// Timeout record
// =============================================================================

/// Scheduler timeout record, embedded in each VP and linked into the
/// scheduler's timeout queue while armed.
pub struct Timeout {
    pub(crate) next: *mut Timeout,
    pub(crate) deadline: Quantums,
    pub(crate) owner: *mut VirtualProcessor,
    pub(crate) is_valid: bool,
}

// =============================================================================
// VirtualProcessor
// =============================================================================

/// The VP control block.
///
/// `rewa_prev`/`rewa_next` link the VP into exactly one of: a ready-queue
/// priority list, a wait queue, or the finalizer queue. `pool_next` links it
/// into one of the pool's in-use/reuse lists.
pub struct VirtualProcessor {
    pub(crate) rewa_prev: *mut VirtualProcessor,
    pub(crate) rewa_next: *mut VirtualProcessor,
    pub(crate) pool_next: *mut VirtualProcessor,

    pub(crate) save_area: SwitchContext,
    pub(crate) kernel_stack: ExecutionStack,
    pub(crate) user_stack: ExecutionStack,

    vpid: VpId,

    /// Kernel stack pointer recorded at the most recent system-call entry.
    /// Points at the slot holding the user-space return address; the forced
    /// abort path patches that slot. Zero when not in a system call.
    pub(crate) syscall_entry_ksp: u64,

    pub(crate) timeout: Timeout,
    pub(crate) waiting_on: *mut WaitQueue,
    pub(crate) wait_start_time: Quantums,
    pub(crate) wakeup_reason: WakeReason,

    pub(crate) priority: i8,
    pub(crate) effective_priority: i8,
    pub(crate) state: VpState,
    pub(crate) flags: VpFlags,
    pub(crate) quantum_allowance: i8,
    pub(crate) suspension_count: i8,

    /// Dispatch queue this VP is currently working for, if any. Weak: the
    /// queue detaches the VP before it can go away.
    pub(crate) dispatch_queue: *mut c_void,
    pub(crate) dispatch_lane_index: i8,
}

static NEXT_VPID: AtomicU32 = AtomicU32::new(1);

impl VirtualProcessor {
    fn new() -> Self {
        Self {
            rewa_prev: ptr::null_mut(),
            rewa_next: ptr::null_mut(),
            pool_next: ptr::null_mut(),
            save_area: SwitchContext::zero(),
            kernel_stack: ExecutionStack::empty(),
            user_stack: ExecutionStack::empty(),
            vpid: NEXT_VPID.fetch_add(1, Ordering::Relaxed),
            syscall_entry_ksp: 0,
            timeout: Timeout {
                next: ptr::null_mut(),
                deadline: QUANTUMS_INFINITY,
                owner: ptr::null_mut(),
                is_valid: false,
            },
            waiting_on: ptr::null_mut(),
            wait_start_time: 0,
            wakeup_reason: WakeReason::None,
            priority: VP_PRIORITY_NORMAL,
            effective_priority: VP_PRIORITY_NORMAL,
            state: VpState::Suspended,
            flags: VpFlags::empty(),
            quantum_allowance: 0,
            suspension_count: 1,
            dispatch_queue: ptr::null_mut(),
            dispatch_lane_index: -1,
        }
    }

    #[inline]
    pub fn vpid(&self) -> VpId {
        self.vpid
    }

    #[inline]
    pub fn state(&self) -> VpState {
        self.state
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.flags.contains(VpFlags::TERMINATED)
    }

    #[inline]
    pub(crate) fn assert_alive(&self) {
        assert!(
            !self.is_terminated(),
            "operation on terminated vp {}",
            self.vpid
        );
    }
}

// =============================================================================
// Intrusive VP list (ready queues, wait queues, finalizer queue)
// =============================================================================

/// Doubly-linked list of VPs threaded through `rewa_prev`/`rewa_next`.
pub struct VpList {
    pub(crate) first: *mut VirtualProcessor,
    pub(crate) last: *mut VirtualProcessor,
}

impl VpList {
    pub const fn new() -> Self {
        Self {
            first: ptr::null_mut(),
            last: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first.is_null()
    }

    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.first;
        while !cur.is_null() {
            n += 1;
            cur = unsafe { (*cur).rewa_next };
        }
        n
    }

    /// Append `vp` at the tail.
    ///
    /// # Safety
    /// `vp` must be valid and not linked into any list.
    pub unsafe fn insert_last(&mut self, vp: *mut VirtualProcessor) {
        debug_assert!((*vp).rewa_prev.is_null() && (*vp).rewa_next.is_null());

        (*vp).rewa_prev = self.last;
        (*vp).rewa_next = ptr::null_mut();
        if self.last.is_null() {
            self.first = vp;
        } else {
            (*self.last).rewa_next = vp;
        }
        self.last = vp;
    }

    /// Insert `vp` after `prev`; `prev == null` inserts at the head.
    ///
    /// # Safety
    /// `vp` must be valid and unlinked; `prev` must be a member or null.
    pub unsafe fn insert_after(&mut self, vp: *mut VirtualProcessor, prev: *mut VirtualProcessor) {
        debug_assert!((*vp).rewa_prev.is_null() && (*vp).rewa_next.is_null());

        if prev.is_null() {
            (*vp).rewa_next = self.first;
            (*vp).rewa_prev = ptr::null_mut();
            if self.first.is_null() {
                self.last = vp;
            } else {
                (*self.first).rewa_prev = vp;
            }
            self.first = vp;
        } else {
            let next = (*prev).rewa_next;
            (*vp).rewa_prev = prev;
            (*vp).rewa_next = next;
            (*prev).rewa_next = vp;
            if next.is_null() {
                self.last = vp;
            } else {
                (*next).rewa_prev = vp;
            }
        }
    }

    /// Unlink `vp`.
    ///
    /// # Safety
    /// `vp` must be a member of this list.
    pub unsafe fn remove(&mut self, vp: *mut VirtualProcessor) {
        let prev = (*vp).rewa_prev;
        let next = (*vp).rewa_next;

        if prev.is_null() {
            self.first = next;
        } else {
            (*prev).rewa_next = next;
        }
        if next.is_null() {
            self.last = prev;
        } else {
            (*next).rewa_prev = prev;
        }
        (*vp).rewa_prev = ptr::null_mut();
        (*vp).rewa_next = ptr::null_mut();
    }

    /// Detach and return the head, or null.
    ///
    /// # Safety
    /// List links must be consistent.
    pub unsafe fn pop_first(&mut self) -> *mut VirtualProcessor {
        let vp = self.first;
        if !vp.is_null() {
            self.remove(vp);
        }
        vp
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Create a new virtual processor. The VP starts out suspended with count 1
/// and has no closure or stacks yet.
pub fn vp_create() -> Result<*mut VirtualProcessor, Errno> {
    let layout = Layout::new::<VirtualProcessor>();
    // SAFETY: layout has non-zero size.
    let raw = unsafe { alloc::alloc::alloc(layout) } as *mut VirtualProcessor;
    if raw.is_null() {
        return Err(Errno::NoMem);
    }

    // SAFETY: raw is valid for writes of VirtualProcessor.
    unsafe {
        raw.write(VirtualProcessor::new());
        // The timeout owner back-reference must point at the final location.
        (*raw).timeout.owner = raw;
    }
    Ok(raw)
}

/// Free a virtual processor. The VP must not be linked into any queue.
///
/// # Safety
/// `vp` must come from `vp_create` and must be dead: off every queue, not
/// running, not the target of any wake-up.
pub unsafe fn vp_destroy(vp: *mut VirtualProcessor) {
    if vp.is_null() {
        return;
    }

    (*vp).kernel_stack.destroy();
    (*vp).user_stack.destroy();

    let layout = Layout::new::<VirtualProcessor>();
    ptr::drop_in_place(vp);
    alloc::alloc::dealloc(vp as *mut u8, layout);
}

/// Set the closure the VP runs when resumed. Only legal while the VP is
/// suspended. Allocates the stacks and seeds the register context so the
/// first resume enters the trampoline.
pub fn vp_set_closure(vp: *mut VirtualProcessor, closure: VpClosure) -> Errno {
    if closure.kernel_stack_size < VP_MIN_KERNEL_STACK_SIZE {
        return Errno::Inval;
    }

    // SAFETY: caller guarantees a valid, suspended VP; suspension makes the
    // control block ours to mutate.
    unsafe {
        (*vp).assert_alive();
        assert!(
            (*vp).suspension_count > 0,
            "set_closure on a vp that is not suspended"
        );

        if let Err(err) = (*vp).kernel_stack.set_max_size(closure.kernel_stack_size) {
            return err;
        }
        if let Err(err) = (*vp).user_stack.set_max_size(closure.user_stack_size) {
            return err;
        }

        // Seed the initial frame: the register switch pops its resume
        // address off the new stack, so the trampoline address goes into
        // the top slot. The trampoline finds the entry function in r12 and
        // its argument in r13, and falls through to relinquish when the
        // entry function returns.
        let top = (*vp).kernel_stack.initial_top();
        let slot = top.sub(8) as *mut u64;
        slot.write(vp_entry_trampoline as *const () as usize as u64);

        (*vp).save_area = SwitchContext::zero();
        (*vp).save_area.rsp = slot as u64;
        (*vp).save_area.r12 = closure.func as usize as u64;
        (*vp).save_area.r13 = closure.context as usize as u64;
        (*vp).save_area.rip = vp_entry_trampoline as *const () as usize as u64;

        (*vp).syscall_entry_ksp = 0;
        (*vp).flags
            .remove(VpFlags::UCALL_IN_PROGRESS | VpFlags::UCALL_ABORTED);
    }

    Errno::Ok
}

/// Returns true if the given VP is currently suspended.
pub fn vp_is_suspended(vp: *mut VirtualProcessor) -> bool {
    let sps = scheduler::disable_preemption();
    // SAFETY: preemption is disabled; the control block is stable.
    let suspended = unsafe { (*vp).suspension_count > 0 };
    scheduler::restore_preemption(sps);
    suspended
}

/// Suspend the given VP. Nestable: the first call takes the VP off the CPU
/// or the ready queue; a VP that is waiting stays parked and simply won't
/// become ready until resumed.
pub fn vp_suspend(vp: *mut VirtualProcessor) -> Errno {
    let sps = scheduler::disable_preemption();

    // SAFETY: preemption disabled.
    let err = unsafe {
        (*vp).assert_alive();

        if (*vp).suspension_count == VP_MAX_SUSPENSION_COUNT {
            Errno::Inval
        } else {
            (*vp).suspension_count += 1;

            match (*vp).state {
                VpState::Ready => {
                    scheduler::remove_vp_locked(vp);
                    (*vp).state = VpState::Suspended;
                }
                VpState::Running => {
                    // We are running, thus not on the ready queue. Force a
                    // context switch away; we resume here once resumed.
                    (*vp).state = VpState::Suspended;
                    scheduler::switch_to_highest_ready();
                }
                VpState::Waiting => {
                    // Not interrupting the wait; it is just a longer wait.
                }
                VpState::Suspended => {}
            }
            Errno::Ok
        }
    };

    scheduler::restore_preemption(sps);
    err
}

/// Resume the given VP, forcefully if `force` (the suspension count drops
/// straight to zero).
pub fn vp_resume(vp: *mut VirtualProcessor, force: bool) -> Errno {
    let sps = scheduler::disable_preemption();

    // SAFETY: preemption disabled.
    let err = unsafe {
        (*vp).assert_alive();

        if (*vp).suspension_count == 0 {
            Errno::Inval
        } else {
            (*vp).suspension_count = if force {
                0
            } else {
                (*vp).suspension_count - 1
            };

            if (*vp).suspension_count == 0 {
                match (*vp).state {
                    VpState::Suspended => {
                        scheduler::add_vp_locked(vp, (*vp).priority);
                        scheduler::maybe_switch_to(vp);
                    }
                    VpState::Waiting => {
                        // Still parked on its wait queue; nothing more to do.
                    }
                    VpState::Ready | VpState::Running => {
                        panic!("resume: vp {} runnable while suspended", (*vp).vpid);
                    }
                }
            }
            Errno::Ok
        }
    };

    scheduler::restore_preemption(sps);
    err
}

/// Returns the base priority of the given VP.
pub fn vp_priority(vp: *mut VirtualProcessor) -> i8 {
    let sps = scheduler::disable_preemption();
    // SAFETY: preemption disabled.
    let pri = unsafe { (*vp).priority };
    scheduler::restore_preemption(sps);
    pri
}

/// Change the base priority of a virtual processor.
///
/// A Ready VP is re-queued at the new priority. A Running VP keeps its CPU
/// until its quantum expires, but base, effective priority and allowance
/// are refreshed. A Waiting or Suspended VP only records the new base; the
/// effective priority is recomputed when it becomes ready again.
pub fn vp_set_priority(vp: *mut VirtualProcessor, priority: i8) {
    let sps = scheduler::disable_preemption();

    // SAFETY: preemption disabled.
    unsafe {
        (*vp).assert_alive();

        if (*vp).priority != priority {
            match (*vp).state {
                VpState::Ready => {
                    scheduler::remove_vp_locked(vp);
                    (*vp).priority = priority;
                    scheduler::add_vp_locked(vp, priority);
                }
                VpState::Waiting | VpState::Suspended => {
                    (*vp).priority = priority;
                }
                VpState::Running => {
                    (*vp).priority = priority;
                    (*vp).effective_priority = priority;
                    (*vp).quantum_allowance =
                        scheduler::quantum_allowance_for_priority(priority);
                }
            }
        }
    }

    scheduler::restore_preemption(sps);
}

/// Bind the VP to the dispatch queue (and concurrency lane) that acquired
/// it, or detach it with a null queue and lane -1.
pub fn vp_set_dispatch_queue(vp: *mut VirtualProcessor, queue: *mut c_void, lane_index: i8) {
    // SAFETY: caller owns the VP (it is suspended or running the caller).
    unsafe {
        (*vp).assert_alive();
        (*vp).dispatch_queue = queue;
        (*vp).dispatch_lane_index = lane_index;
    }
}

#[inline]
pub fn vp_dispatch_queue(vp: *mut VirtualProcessor) -> *mut c_void {
    // SAFETY: the back-reference is only written while the VP is owned.
    unsafe { (*vp).dispatch_queue }
}

#[inline]
pub fn vp_dispatch_lane_index(vp: *mut VirtualProcessor) -> i8 {
    // SAFETY: as above.
    unsafe { (*vp).dispatch_lane_index }
}

/// Returns the currently running VP.
pub fn vp_current() -> *mut VirtualProcessor {
    scheduler::current_vp()
}

/// Returns the VPID of the currently running VP.
pub fn vp_current_vpid() -> VpId {
    let vp = scheduler::current_vp();
    if vp.is_null() {
        return vireo_abi::vp::INVALID_VPID;
    }
    // SAFETY: the vpid of the running VP never changes underneath it.
    unsafe { (*vp).vpid() }
}

/// Sleep for the given interval. Returns `Intr` if an interruptible wait
/// was cut short, `Ok` otherwise (including timeout, which is the normal
/// way a sleep ends).
pub fn vp_sleep(delay: TimeInterval) -> Errno {
    if delay <= TimeInterval::ZERO {
        return Errno::Ok;
    }

    let deadline = clock::clock_current_time().add(delay);

    // Short delays burn the CPU; anything longer parks on the sleep queue.
    if clock::clock_delay_until(deadline) {
        return Errno::Ok;
    }

    let sps = scheduler::disable_preemption();
    let err = unsafe { scheduler::wait_on(scheduler::sleep_queue(), deadline, true) };
    scheduler::restore_preemption(sps);

    if err == Errno::Intr {
        Errno::Intr
    } else {
        Errno::Ok
    }
}

/// Relinquish the calling VP back to the pool. Must only be invoked from
/// the bottom-most frame on the VP's kernel stack; does not return.
pub fn vp_relinquish() -> ! {
    crate::sched::pool::pool_shared().relinquish(vp_current());
}

/// Entry point the trampoline falls through to when a VP closure returns.
pub(crate) extern "C" fn vp_relinquish_entry() {
    vp_relinquish();
}

/// Terminate the calling VP. The scheduler routes it to the finalizer
/// queue; the storage is reclaimed by the scheduler VP. Does not return.
pub fn vp_terminate(vp: *mut VirtualProcessor) -> ! {
    // SAFETY: vp is the caller's own control block.
    unsafe {
        (*vp).assert_alive();
        (*vp).flags.insert(VpFlags::TERMINATED);
    }
    scheduler::terminate_current_vp(vp);
}

// =============================================================================
// User-space calls and forced abort
// =============================================================================

/// Record the kernel stack pointer at system-call entry. `ksp` must point
/// at the slot holding the user-space return address; the forced abort path
/// patches that slot. Pass 0 on system-call exit.
pub fn vp_record_syscall_entry(vp: *mut VirtualProcessor, ksp: u64) {
    // SAFETY: only the VP itself records its syscall entry.
    unsafe {
        (*vp).syscall_entry_ksp = ksp;
    }
}

/// Invoke `func(context, arg)` as a user-space call on the calling VP.
///
/// On hardware with privilege separation this drops to user mode through a
/// trampoline; this build runs the closure directly. Either way the
/// contract holds: the closure runs, and on return or forced abort control
/// comes back to the caller. Calls cannot be nested.
pub fn vp_call_as_user(
    func: extern "C" fn(*mut c_void, *mut c_void),
    context: *mut c_void,
    arg: *mut c_void,
) {
    let vp = vp_current();

    // SAFETY: vp is the caller's own control block.
    unsafe {
        assert!(
            !(*vp).flags.contains(VpFlags::UCALL_IN_PROGRESS),
            "nested call_as_user"
        );
        (*vp).flags.insert(VpFlags::UCALL_IN_PROGRESS);
        (*vp).flags.remove(VpFlags::UCALL_ABORTED);
    }

    func(context, arg);

    // SAFETY: as above.
    unsafe {
        (*vp).flags
            .remove(VpFlags::UCALL_IN_PROGRESS | VpFlags::UCALL_ABORTED);
    }
}

/// Landing site for an aborted user-space call. A patched system-call
/// return lands here instead of back in user code; execution then unwinds
/// to the run loop that issued the call.
pub extern "C" fn vp_ucall_abort_entry() {
    let vp = vp_current();
    // SAFETY: vp is the caller's own control block.
    unsafe {
        (*vp).flags
            .remove(VpFlags::UCALL_IN_PROGRESS | VpFlags::UCALL_ABORTED);
    }
}

/// Abort an on-going user-space call on `vp`, forcing the user stack to
/// unwind to the abort trampoline. Idempotent.
///
/// If the VP is in a system call, the call runs to completion but its
/// return-to-user slot is patched so it lands in the trampoline, and an
/// interruptible wait is woken with reason `Interrupted`. If the VP is in
/// user space, its saved program counter is rewritten, which is only legal
/// from a different VP.
pub fn vp_abort_call_as_user(vp: *mut VirtualProcessor) -> Errno {
    let is_self = vp == vp_current();

    if !is_self {
        let err = vp_suspend(vp);
        if err != Errno::Ok {
            return err;
        }
    }

    // SAFETY: target is suspended (or is the caller itself); its control
    // block and saved context are stable.
    unsafe {
        if (*vp).flags.contains(VpFlags::UCALL_IN_PROGRESS) {
            (*vp).flags.insert(VpFlags::UCALL_ABORTED);
        }

        if (*vp).syscall_entry_ksp != 0 {
            // In a system call: let it finish, but patch the recorded
            // return slot so the return to user space lands in the abort
            // trampoline.
            let slot = (*vp).syscall_entry_ksp as *mut u64;
            slot.write(vp_ucall_abort_entry as *const () as usize as u64);

            if (*vp).state == VpState::Waiting {
                let sps = scheduler::disable_preemption();
                let _ = scheduler::wake_one(
                    (*vp).waiting_on,
                    vp,
                    WakeReason::Interrupted,
                    false,
                );
                scheduler::restore_preemption(sps);
            }
        } else {
            // In user space: rewrite the saved program counter. A VP may
            // not rewrite its own live PC.
            if is_self {
                panic!("abort_call_as_user: cannot rewrite own live pc");
            }
            (*vp).save_area.rip = vp_ucall_abort_entry as *const () as usize as u64;
        }
    }

    if !is_self {
        let _ = vp_resume(vp, false);
    }

    Errno::Ok
}
