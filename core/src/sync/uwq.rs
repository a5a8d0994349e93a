//! User wait queue.
//!
//! The primitive user space builds futex-like synchronization on. A plain
//! queue parks and wakes; a signalling queue additionally latches a signal
//! mask: wake-ups OR caller bits into the latch, and waiters consume and
//! clear the whole latch when they return.

use core::cell::UnsafeCell;

use vireo_abi::errno::Errno;
use vireo_abi::time::TimeInterval;
use vireo_abi::vp::WakeReason;

use crate::clock;
use crate::sched::scheduler::{self, WaitQueue};

/// How many waiters a wake-up releases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UwqWakePolicy {
    One,
    All,
}

struct UwqInner {
    wait_queue: WaitQueue,
    latched_sigs: u32,
}

pub struct UserWaitQueue {
    signalling: bool,
    inner: UnsafeCell<UwqInner>,
}

// SAFETY: the inner state is only accessed with preemption disabled on a
// single CPU.
unsafe impl Send for UserWaitQueue {}
unsafe impl Sync for UserWaitQueue {}

impl UserWaitQueue {
    pub const fn new(signalling: bool) -> Self {
        Self {
            signalling,
            inner: UnsafeCell::new(UwqInner {
                wait_queue: WaitQueue::new(),
                latched_sigs: 0,
            }),
        }
    }

    #[inline]
    pub fn is_signalling(&self) -> bool {
        self.signalling
    }

    /// Park until woken. In signalling mode, returns the latched mask and
    /// clears it; in plain mode returns 0. Always interruptible.
    pub fn wait(&self) -> Result<u32, Errno> {
        self.wait_until(TimeInterval::INFINITY)
    }

    /// Park until woken or until `deadline`. `absolute` selects whether
    /// `deadline` is a point on the monotonic timeline or relative to now.
    pub fn timed_wait(&self, deadline: TimeInterval, absolute: bool) -> Result<u32, Errno> {
        let deadline = if absolute {
            deadline
        } else {
            clock::clock_current_time().add(deadline)
        };
        self.wait_until(deadline)
    }

    fn wait_until(&self, deadline: TimeInterval) -> Result<u32, Errno> {
        let sps = scheduler::disable_preemption();

        // SAFETY: preemption disabled.
        let result = unsafe {
            let inner = &mut *self.inner.get();
            loop {
                if self.signalling && inner.latched_sigs != 0 {
                    let sigs = inner.latched_sigs;
                    inner.latched_sigs = 0;
                    break Ok(sigs);
                }

                let err = scheduler::wait_on(&raw mut inner.wait_queue, deadline, true);
                if err != Errno::Ok {
                    break Err(err);
                }
                if !self.signalling {
                    break Ok(0);
                }
                // Signalling mode: re-check the latch; it may have been
                // consumed by another waiter already.
            }
        };

        scheduler::restore_preemption(sps);
        result
    }

    /// Latch `sigs` (signalling mode) and wake waiters per `policy`.
    /// A zero mask is a no-op.
    pub fn wakeup(&self, policy: UwqWakePolicy, sigs: u32) {
        if sigs == 0 {
            return;
        }

        let count = match policy {
            UwqWakePolicy::One => 1,
            UwqWakePolicy::All => usize::MAX,
        };

        let sps = scheduler::disable_preemption();

        // SAFETY: preemption disabled.
        unsafe {
            let inner = &mut *self.inner.get();
            if self.signalling {
                inner.latched_sigs |= sigs;
            }
            scheduler::wake_some(&raw mut inner.wait_queue, count, WakeReason::Finished, true);
        }

        scheduler::restore_preemption(sps);
    }

    /// The latched, not yet consumed signal mask.
    pub fn pending_sigs(&self) -> u32 {
        let sps = scheduler::disable_preemption();
        // SAFETY: preemption disabled.
        let sigs = unsafe { (*self.inner.get()).latched_sigs };
        scheduler::restore_preemption(sps);
        sigs
    }
}

impl Drop for UserWaitQueue {
    fn drop(&mut self) {
        let sps = scheduler::disable_preemption();
        // SAFETY: &mut self gives exclusive access.
        unsafe {
            let inner = &mut *self.inner.get();
            if !inner.wait_queue.is_empty() {
                scheduler::wake_some(
                    &raw mut inner.wait_queue,
                    usize::MAX,
                    WakeReason::Interrupted,
                    true,
                );
            }
        }
        scheduler::restore_preemption(sps);
    }
}
