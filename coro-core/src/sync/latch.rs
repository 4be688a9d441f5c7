//! Latch — a count-down barrier, plus `SyncLatch`, the same semantics for
//! plain (non-coroutine) threads that need to block.

use std::sync::atomic::{AtomicU64, Ordering};

use super::condvar::CondVar;

/// Counts down from `n` to zero; `wait()` suspends the caller until the
/// counter reaches zero. Callers must ensure the total of `count_down(k)`
/// and `arrive_and_wait(k)` calls sums to exactly `n` — over/undercount
/// behavior is intentionally left unspecified.
pub struct Latch {
    count: AtomicU64,
    cv: CondVar,
    gate: tokio::sync::Mutex<()>,
}

impl Latch {
    pub fn new(n: u64) -> Self {
        Self {
            count: AtomicU64::new(n),
            cv: CondVar::new(),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn count_down(&self, k: u64) {
        let prev = self.count.fetch_sub(k, Ordering::AcqRel);
        if prev.wrapping_sub(k) == 0 {
            self.cv.notify_all();
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        if self.count.load(Ordering::Acquire) == 0 {
            return;
        }
        let guard = self.gate.lock().await;
        let _ = self
            .cv
            .wait(&self.gate, guard, |_| self.count.load(Ordering::Acquire) == 0, None)
            .await;
    }

    pub async fn arrive_and_wait(&self, k: u64) {
        self.count_down(k);
        self.wait().await;
    }
}

/// Thread-blocking counterpart of [`Latch`] for callers outside the
/// coroutine world.
pub struct SyncLatch {
    count: std::sync::Mutex<u64>,
    cv: std::sync::Condvar,
}

impl SyncLatch {
    pub fn new(n: u64) -> Self {
        Self {
            count: std::sync::Mutex::new(n),
            cv: std::sync::Condvar::new(),
        }
    }

    pub fn count_down(&self, k: u64) {
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_sub(k);
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cv.wait(count).unwrap();
        }
    }

    pub fn arrive_and_wait(&self, k: u64) {
        self.count_down(k);
        self.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn releases_all_waiters_once_drained() {
        let latch = Arc::new(Latch::new(3));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let latch = Arc::clone(&latch);
            handles.push(tokio::spawn(async move { latch.wait().await }));
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        latch.count_down(2);
        latch.count_down(1);
        for h in handles {
            h.await.unwrap();
        }
    }

    #[test]
    fn sync_latch_blocks_until_zero() {
        let latch = Arc::new(SyncLatch::new(2));
        let waiter = {
            let latch = Arc::clone(&latch);
            std::thread::spawn(move || latch.wait())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        latch.count_down(2);
        waiter.join().unwrap();
    }
}
