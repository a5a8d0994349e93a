pub mod condvar;
pub mod mutex;
pub mod semaphore;
pub mod uwq;

pub mod sync_tests;

pub use condvar::ConditionVariable;
pub use mutex::Mutex;
pub use semaphore::Semaphore;
pub use uwq::{UserWaitQueue, UwqWakePolicy};
