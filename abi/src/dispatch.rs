//! Dispatch-queue options, quality-of-service classes and limits.

use bitflags::bitflags;

use crate::vp::{VP_PRIORITIES_RESERVED_HIGH, VP_PRIORITIES_RESERVED_LOW, VP_PRIORITY_COUNT};

bitflags! {
    /// Options accepted by the general dispatch entry point.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DispatchOptions: u32 {
        /// Block the caller until the closure has finished executing.
        const SYNC = 0x01;
        /// Drop the dispatch if an equally-tagged item is already queued
        /// or executing.
        const COALESCE = 0x02;
        /// Run the closure through the user-mode trampoline.
        const USER = 0x04;
    }
}

/// Quality-of-service class of a dispatch queue. Together with the
/// priority-within-class this selects the scheduling priority of the queue's
/// worker VPs.
#[repr(i8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DispatchQos {
    Idle = 0,
    Background = 1,
    Utility = 2,
    Default = 3,
    UserInitiated = 4,
    Interactive = 5,
}

impl DispatchQos {
    #[inline]
    pub fn as_i8(self) -> i8 {
        self as i8
    }
}

pub const DISPATCH_QOS_COUNT: i8 = 6;

/// Priorities within one QoS class, centered on 0:
/// `-DISPATCH_PRIORITY_COUNT/2 ..= DISPATCH_PRIORITY_COUNT/2 - 1`.
pub const DISPATCH_PRIORITY_COUNT: i8 = 10;

pub const DISPATCH_PRIORITY_LOWEST: i8 = -(DISPATCH_PRIORITY_COUNT / 2);
pub const DISPATCH_PRIORITY_HIGHEST: i8 = DISPATCH_PRIORITY_COUNT / 2 - 1;

// The six QoS bands of ten priorities each exactly cover the application
// priority range between the scheduler's reserved bands.
const _: () = assert!(
    (DISPATCH_QOS_COUNT * DISPATCH_PRIORITY_COUNT) as usize
        == VP_PRIORITY_COUNT
            - VP_PRIORITIES_RESERVED_HIGH as usize
            - VP_PRIORITIES_RESERVED_LOW as usize
);

/// Lifecycle state of a dispatch queue.
#[repr(i8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueState {
    /// Accepting and executing work.
    Running = 0,
    /// Terminate was called; workers are draining out.
    Terminating = 1,
    /// All workers relinquished; safe to destroy.
    Terminated = 2,
}

/// Upper bound on the inline argument copy attached to a work item.
pub const MAX_ARG_BYTES: usize = 256;

/// Baseline size of the per-queue work-item reuse cache. The effective
/// capacity is `max(MAX_ITEM_CACHE_COUNT, max_concurrency)`.
pub const MAX_ITEM_CACHE_COUNT: usize = 8;

/// Concurrency lane bounds for a dispatch queue.
pub const DISPATCH_MIN_CONCURRENCY: i8 = 1;
pub const DISPATCH_MAX_CONCURRENCY: i8 = 127;
