//! Mutex — an awaitable mutex with FIFO fairness, built on [`CondVar`]
//! the classic way: a boolean `locked` flag guarded by an inner lock, with
//! waiters parked on the condvar and woken one at a time in arrival order.

use std::ops::{Deref, DerefMut};

use super::condvar::CondVar;

struct State<T> {
    locked: bool,
    value: T,
}

pub struct Mutex<T> {
    inner: tokio::sync::Mutex<State<T>>,
    cv: CondVar,
}

impl<T: Send> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(State {
                locked: false,
                value,
            }),
            cv: CondVar::new(),
        }
    }

    /// Acquires the lock, suspending the caller if it's already held.
    /// Waiters are granted the lock strictly in arrival order.
    pub async fn lock(&self) -> MutexGuard<'_, T> {
        let guard = self.inner.lock().await;
        let mut guard = self
            .cv
            .wait(&self.inner, guard, |s| !s.locked, None)
            .await
            .expect("unbounded wait never times out or aborts in normal operation");
        guard.locked = true;
        MutexGuard {
            mutex: self,
            guard: Some(guard),
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut guard = self.inner.try_lock().ok()?;
        if guard.locked {
            return None;
        }
        guard.locked = true;
        Some(MutexGuard {
            mutex: self,
            guard: Some(guard),
        })
    }
}

pub struct MutexGuard<'a, T: Send> {
    mutex: &'a Mutex<T>,
    guard: Option<tokio::sync::MutexGuard<'a, State<T>>>,
}

impl<T: Send> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard.as_ref().unwrap().value
    }
}

impl<T: Send> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard.as_mut().unwrap().value
    }
}

impl<T: Send> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            guard.locked = false;
            drop(guard);
            self.mutex.cv.notify_one();
        }
    }
}
