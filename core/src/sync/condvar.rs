//! Condition variable.
//!
//! Wait atomically releases the associated mutex, parks, and re-acquires
//! on return. Signal and broadcast accept an optional mutex that is
//! unlocked while the wake is in flight; cooperation (voluntary context
//! switching) is disabled across the unlock so a waiter cannot be woken
//! and run while the signaller still holds the lock.

use core::cell::UnsafeCell;

use vireo_abi::errno::Errno;
use vireo_abi::time::TimeInterval;
use vireo_abi::vp::WakeReason;

use crate::sched::scheduler::{self, WaitQueue};
use crate::sync::mutex::Mutex;

pub struct ConditionVariable {
    name: &'static str,
    wait_queue: UnsafeCell<WaitQueue>,
}

// SAFETY: the wait queue is only accessed with preemption disabled on a
// single CPU.
unsafe impl Send for ConditionVariable {}
unsafe impl Sync for ConditionVariable {}

impl ConditionVariable {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            wait_queue: UnsafeCell::new(WaitQueue::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Unlock `mutex` and block until signalled or `deadline` passes, then
    /// re-acquire `mutex`. The wait is interruptible.
    ///
    /// The caller must hold `mutex`.
    pub fn wait(&self, mutex: &Mutex, deadline: TimeInterval) -> Errno {
        let sps = scheduler::disable_preemption();
        let scs = scheduler::disable_cooperation();

        mutex.unlock();
        scheduler::restore_cooperation(scs);

        // SAFETY: preemption disabled; the queue lives as long as self.
        let err = unsafe { scheduler::wait_on(self.wait_queue.get(), deadline, true) };

        mutex.lock();
        scheduler::restore_preemption(sps);
        err
    }

    /// Wake one waiter (the highest-priority one). Atomically unlocks
    /// `mutex` first if given.
    pub fn signal_and_unlock(&self, mutex: Option<&Mutex>) {
        self.wake_and_unlock(mutex, 1);
    }

    /// Wake all waiters. Atomically unlocks `mutex` first if given.
    pub fn broadcast_and_unlock(&self, mutex: Option<&Mutex>) {
        self.wake_and_unlock(mutex, usize::MAX);
    }

    /// Wake one waiter without touching any mutex.
    pub fn signal(&self) {
        self.wake_and_unlock(None, 1);
    }

    /// Wake all waiters without touching any mutex.
    pub fn broadcast(&self) {
        self.wake_and_unlock(None, usize::MAX);
    }

    fn wake_and_unlock(&self, mutex: Option<&Mutex>, count: usize) {
        let sps = scheduler::disable_preemption();
        let scs = scheduler::disable_cooperation();

        if let Some(mutex) = mutex {
            mutex.unlock();
        }
        scheduler::restore_cooperation(scs);

        // SAFETY: preemption disabled.
        unsafe {
            scheduler::wake_some(self.wait_queue.get(), count, WakeReason::Finished, true);
        }

        scheduler::restore_preemption(sps);
    }

    pub fn has_waiters(&self) -> bool {
        let sps = scheduler::disable_preemption();
        // SAFETY: preemption disabled.
        let waiting = unsafe { !(*self.wait_queue.get()).is_empty() };
        scheduler::restore_preemption(sps);
        waiting
    }
}

impl Drop for ConditionVariable {
    /// Any VP still parked here is woken with reason `Interrupted`.
    fn drop(&mut self) {
        let sps = scheduler::disable_preemption();
        // SAFETY: preemption disabled; &mut self gives exclusive access.
        unsafe {
            let queue = self.wait_queue.get();
            if !(*queue).is_empty() {
                scheduler::wake_some(queue, usize::MAX, WakeReason::Interrupted, true);
            }
        }
        scheduler::restore_preemption(sps);
    }
}
