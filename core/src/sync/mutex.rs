//! Sleeping mutex.
//!
//! A busy word plus a wait queue. Contended lockers park on the queue with
//! an infinite, non-interruptible wait; unlock wakes all waiters and the
//! first one to run re-acquires. Not recursive. Unlocking a mutex you do
//! not own is a fatal error, not a return code.
//!
//! State is interior-mutable and only ever touched with preemption
//! disabled, per the shared-resource policy of the concurrency core.

use core::cell::UnsafeCell;

use vireo_abi::time::TimeInterval;
use vireo_abi::vp::{INVALID_VPID, VpId};

use crate::sched::scheduler::{self, WaitQueue};
use crate::sched::vp::vp_current_vpid;

struct MutexInner {
    /// 0 = unlocked, 1 = locked.
    value: u32,
    owner_vpid: VpId,
    wait_queue: WaitQueue,
}

pub struct Mutex {
    inner: UnsafeCell<MutexInner>,
}

// SAFETY: the inner state is only accessed with preemption disabled on a
// single CPU.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(MutexInner {
                value: 0,
                owner_vpid: INVALID_VPID,
                wait_queue: WaitQueue::new(),
            }),
        }
    }

    /// Acquire the mutex, parking the caller while another VP holds it.
    pub fn lock(&self) {
        let sps = scheduler::disable_preemption();

        // SAFETY: preemption disabled.
        unsafe {
            let inner = &mut *self.inner.get();
            loop {
                if inner.value == 0 {
                    inner.value = 1;
                    inner.owner_vpid = vp_current_vpid();
                    break;
                }
                // Held by somebody else. Park; the unlock path wakes us and
                // we retry against any other woken waiter.
                let _ = scheduler::wait_on(
                    &raw mut inner.wait_queue,
                    TimeInterval::INFINITY,
                    false,
                );
            }
        }

        scheduler::restore_preemption(sps);
    }

    /// Try to acquire the mutex without blocking.
    pub fn try_lock(&self) -> bool {
        let sps = scheduler::disable_preemption();

        // SAFETY: preemption disabled.
        let acquired = unsafe {
            let inner = &mut *self.inner.get();
            if inner.value == 0 {
                inner.value = 1;
                inner.owner_vpid = vp_current_vpid();
                true
            } else {
                false
            }
        };

        scheduler::restore_preemption(sps);
        acquired
    }

    /// Release the mutex and wake all waiters.
    ///
    /// Panics if the caller is not the owner.
    pub fn unlock(&self) {
        let sps = scheduler::disable_preemption();

        // SAFETY: preemption disabled.
        unsafe {
            let inner = &mut *self.inner.get();
            if inner.owner_vpid != vp_current_vpid() {
                panic!(
                    "mutex unlock by vp {} but owner is {}",
                    vp_current_vpid(),
                    inner.owner_vpid
                );
            }

            inner.owner_vpid = INVALID_VPID;
            inner.value = 0;
            scheduler::wake_all(&raw mut inner.wait_queue, true);
        }

        scheduler::restore_preemption(sps);
    }

    /// The VPID currently holding the mutex, or `INVALID_VPID`.
    pub fn owner_vpid(&self) -> VpId {
        let sps = scheduler::disable_preemption();
        // SAFETY: preemption disabled.
        let owner = unsafe { (*self.inner.get()).owner_vpid };
        scheduler::restore_preemption(sps);
        owner
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        // SAFETY: &mut self gives exclusive access.
        let inner = unsafe { &mut *self.inner.get() };
        assert!(
            inner.wait_queue.is_empty(),
            "mutex dropped with waiters parked"
        );
    }
}
