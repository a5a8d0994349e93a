#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod clock;
pub mod dispatch;
pub mod sched;
pub mod sync;

pub mod clock_tests;

pub use sched::pool;
pub use sched::scheduler;
pub use sched::sched_tests;
pub use sched::vp;
pub use sync::sync_tests;

pub use dispatch::dispatch_tests;
pub use dispatch::queue::DispatchQueue;
