//! Synchronization primitives layered on address-keyed sleep.

pub mod condvar;
pub mod deque;
pub mod latch;
pub mod mutex;
pub mod promise;

pub use condvar::CondVar;
pub use deque::Deque;
pub use latch::{Latch, SyncLatch};
pub use mutex::{Mutex, MutexGuard};
pub use promise::{FutureState, Promise, SharedFuture, detach_task};
