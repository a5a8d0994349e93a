//! Counting semaphore.
//!
//! Acquire decrements the count if positive, otherwise parks on the wait
//! queue until a release, a timeout or an interruption. Release increments
//! and wakes one waiter. The release path has an interrupt-safe variant
//! that defers any context switch until interrupt return, for use by
//! device drivers.

use core::cell::UnsafeCell;

use vireo_abi::errno::Errno;
use vireo_abi::time::TimeInterval;
use vireo_abi::vp::WakeReason;

use crate::sched::scheduler::{self, WaitQueue};

struct SemInner {
    count: i32,
    wait_queue: WaitQueue,
}

pub struct Semaphore {
    inner: UnsafeCell<SemInner>,
}

// SAFETY: the inner state is only accessed with preemption disabled on a
// single CPU.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub const fn new(initial_count: i32) -> Self {
        Self {
            inner: UnsafeCell::new(SemInner {
                count: initial_count,
                wait_queue: WaitQueue::new(),
            }),
        }
    }

    /// Acquire one permit, waiting until `deadline` if none is available.
    /// The wait is interruptible.
    pub fn acquire(&self, deadline: TimeInterval) -> Errno {
        let sps = scheduler::disable_preemption();

        // SAFETY: preemption disabled.
        let err = unsafe {
            let inner = &mut *self.inner.get();
            loop {
                if inner.count > 0 {
                    inner.count -= 1;
                    break Errno::Ok;
                }

                let err = scheduler::wait_on(&raw mut inner.wait_queue, deadline, true);
                if err != Errno::Ok {
                    break err;
                }
                // Woken by a release; retry the decrement in case another
                // woken waiter got there first.
            }
        };

        scheduler::restore_preemption(sps);
        err
    }

    /// Acquire one permit without blocking.
    pub fn try_acquire(&self) -> bool {
        let sps = scheduler::disable_preemption();

        // SAFETY: preemption disabled.
        let acquired = unsafe {
            let inner = &mut *self.inner.get();
            if inner.count > 0 {
                inner.count -= 1;
                true
            } else {
                false
            }
        };

        scheduler::restore_preemption(sps);
        acquired
    }

    /// Release one permit and wake one waiter.
    pub fn release(&self) {
        let sps = scheduler::disable_preemption();

        // SAFETY: preemption disabled.
        unsafe {
            let inner = &mut *self.inner.get();
            inner.count += 1;
            scheduler::wake_some(&raw mut inner.wait_queue, 1, WakeReason::Finished, true);
        }

        scheduler::restore_preemption(sps);
    }

    /// Release from an interrupt handler. Never context switches; the
    /// woken VP runs once the scheduler next gets a chance.
    pub fn release_from_interrupt(&self) {
        // SAFETY: interrupt context implies the scheduler cannot run
        // concurrently on this single-CPU design.
        unsafe {
            let inner = &mut *self.inner.get();
            inner.count += 1;
            scheduler::wake_all_from_interrupt(&raw mut inner.wait_queue);
        }
    }

    /// Current permit count. Diagnostic only; stale the moment it returns.
    pub fn count(&self) -> i32 {
        let sps = scheduler::disable_preemption();
        // SAFETY: preemption disabled.
        let count = unsafe { (*self.inner.get()).count };
        scheduler::restore_preemption(sps);
        count
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: &mut self gives exclusive access.
        let inner = unsafe { &mut *self.inner.get() };
        assert!(
            inner.wait_queue.is_empty(),
            "semaphore dropped with waiters parked"
        );
    }
}
