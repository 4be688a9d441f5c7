//! Condition variable.

use std::time::Instant;

use crate::coroutine::sleep::{self, Addr, SleepOutcome};
use crate::error::CoreError;

/// Wait/notify built on top of address-keyed sleep. Pairs with a
/// `tokio::sync::Mutex<T>` the same way `std::sync::Condvar` pairs with
/// `std::sync::Mutex`: the caller passes both the mutex and the guard so
/// the condvar can drop the lock across the suspension and reacquire it
/// before re-checking the predicate.
pub struct CondVar {
    addr: Addr,
}

impl CondVar {
    pub fn new() -> Self {
        Self {
            addr: sleep::fresh_addr(),
        }
    }

    /// Waits until `predicate(&*guard)` holds, or `deadline` elapses.
    ///
    /// Five steps on every iteration: predicate check, deadline check,
    /// address-keyed sleep (head-inserted on re-wait after a spurious wake
    /// so FIFO position is preserved), lock drop/reacquire, and outcome
    /// mapping (natural timer -> `TIMEOUT`, cancel -> loop again).
    pub async fn wait<'a, T: Send>(
        &self,
        mutex: &'a tokio::sync::Mutex<T>,
        mut guard: tokio::sync::MutexGuard<'a, T>,
        mut predicate: impl FnMut(&T) -> bool + Send,
        deadline: Option<Instant>,
    ) -> Result<tokio::sync::MutexGuard<'a, T>, CoreError> {
        let mut insert_head = false;
        loop {
            if predicate(&guard) {
                return Ok(guard);
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(CoreError::timeout());
                }
            }
            // Register before dropping the guard: a notifier that mutates
            // the predicate and calls `notify*` between the drop and the
            // registration would otherwise run `cancel_sleep_by_addr`
            // against zero waiters, and this waiter would then register
            // too late and block forever (deadline is often `None`).
            let ticket = sleep::register(self.addr, insert_head);
            drop(guard);
            let outcome = ticket.wait(deadline).await;
            insert_head = true;
            match outcome {
                SleepOutcome::Success => return Err(CoreError::timeout()),
                SleepOutcome::Canceled => {
                    guard = mutex.lock().await;
                }
                SleepOutcome::Aborted => return Err(CoreError::aborted()),
            }
        }
    }

    /// Wakes up to `n` waiters.
    pub fn notify(&self, n: usize) -> usize {
        sleep::cancel_sleep_by_addr(self.addr, n)
    }

    pub fn notify_one(&self) -> usize {
        self.notify(1)
    }

    pub fn notify_all(&self) -> usize {
        self.notify(usize::MAX)
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}
