//! Virtual processor states, priorities and flags.

use bitflags::bitflags;

/// Unique VP identity. Id 0 is reserved to mean "no VP".
pub type VpId = u32;

pub const INVALID_VPID: VpId = 0;

/// Scheduling state of a virtual processor.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VpState {
    /// Able to run, sitting on the ready queue.
    Ready = 0,
    /// Executing on the CPU right now.
    Running = 1,
    /// Parked on a wait queue.
    Waiting = 2,
    /// Suspension count > 0; not eligible for scheduling.
    Suspended = 3,
}

impl VpState {
    pub fn from_u8(raw: u8) -> VpState {
        match raw {
            0 => VpState::Ready,
            1 => VpState::Running,
            2 => VpState::Waiting,
            _ => VpState::Suspended,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Why a waiting VP was made runnable again. `None` means the wait is still
/// in progress.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeReason {
    None = 0,
    Finished = 1,
    Interrupted = 2,
    Timeout = 3,
}

bitflags! {
    /// Per-VP flag word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VpFlags: u8 {
        /// Terminate was called; the VP is on its way to the finalizer.
        const TERMINATED        = 0x01;
        /// A user-space call is in progress on this VP.
        const UCALL_IN_PROGRESS = 0x02;
        /// The in-progress user-space call has been aborted and is unwinding.
        const UCALL_ABORTED     = 0x04;
        /// The current wait may be ended early with reason `Interrupted`.
        const INTERRUPTIBLE_WAIT = 0x08;
    }
}

// Priorities. 64 levels; the top two and bottom two are reserved for the
// scheduler's own VPs (boot and idle) and must not be handed to application
// code.

pub const VP_PRIORITY_COUNT: usize = 64;
pub const VP_PRIORITY_HIGHEST: i8 = 63;
pub const VP_PRIORITY_REALTIME: i8 = 56;
pub const VP_PRIORITY_NORMAL: i8 = 42;
pub const VP_PRIORITY_LOWEST: i8 = 0;

/// Bytes in the ready-queue population bitmap.
pub const VP_PRIORITY_POP_BYTE_COUNT: usize = (VP_PRIORITY_COUNT + 7) / 8;

pub const VP_PRIORITIES_RESERVED_HIGH: i8 = 2;
pub const VP_PRIORITIES_RESERVED_LOW: i8 = 2;

/// Highest priority assignable to non-scheduler code.
pub const VP_PRIORITY_APP_HIGHEST: i8 = VP_PRIORITY_HIGHEST - VP_PRIORITIES_RESERVED_HIGH;

// Stack sizing.

pub const VP_MIN_KERNEL_STACK_SIZE: usize = 256;
pub const VP_DEFAULT_KERNEL_STACK_SIZE: usize = 16 * 1024;
pub const VP_DEFAULT_USER_STACK_SIZE: usize = 16 * 1024;

/// Deepest legal suspend nesting.
pub const VP_MAX_SUSPENSION_COUNT: i8 = i8::MAX;
