#![no_std]

pub mod dispatch;
pub mod errno;
pub mod time;
pub mod vp;

pub use errno::Errno;
pub use time::{ONE_SECOND_IN_NANOS, QUANTUMS_INFINITY, QuantumRounding, Quantums, TimeInterval};
pub use vp::{INVALID_VPID, VpFlags, VpId, VpState, WakeReason};
