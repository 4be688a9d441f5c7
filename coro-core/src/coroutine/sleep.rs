//! Address-keyed wait: a timer registered under an opaque address, cancelable
//! by a third party that only knows the same address.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Opaque address key. Any `usize`-sized value works as long as it's unique
/// among everyone currently asleep on it — callers typically derive one from
/// a pointer or a monotonic counter (see [`fresh_addr`]).
pub type Addr = usize;

static NEXT_ADDR: AtomicU64 = AtomicU64::new(1);

/// Mints a fresh, process-unique address for types that don't have a
/// natural pointer identity to reuse (tests, synthetic addresses).
pub fn fresh_addr() -> Addr {
    NEXT_ADDR.fetch_add(1, Ordering::Relaxed) as Addr
}

/// Outcome of a `sleep` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The timer elapsed naturally.
    Success,
    /// Someone called `cancel_sleep_by_addr` and woke this waiter.
    Canceled,
    /// The process is tearing down.
    Aborted,
}

struct Waiter {
    seq: u64,
    tx: oneshot::Sender<SleepOutcome>,
}

#[derive(Default)]
struct Registry {
    waiters: HashMap<Addr, Vec<Waiter>>,
    next_seq: u64,
}

fn registry() -> &'static Mutex<Registry> {
    static REG: OnceLock<Mutex<Registry>> = OnceLock::new();
    REG.get_or_init(|| Mutex::new(Registry::default()))
}

fn remove_waiter(addr: Addr, seq: u64) {
    let mut reg = registry().lock();
    if let Some(list) = reg.waiters.get_mut(&addr) {
        list.retain(|w| w.seq != seq);
        if list.is_empty() {
            reg.waiters.remove(&addr);
        }
    }
}

/// A waiter that has already been registered in the address registry.
/// Splitting registration from the actual wait lets a caller close the
/// "check predicate, then register" race: register the ticket while still
/// holding whatever lock guards the predicate, drop the lock, then await
/// the ticket. A `cancel_sleep_by_addr` that runs after registration but
/// before the await always finds (and wakes) this waiter; one that runs
/// before registration is simply too early and the fresh registration below
/// will observe the already-changed state instead.
pub struct SleepTicket {
    addr: Addr,
    seq: u64,
    rx: oneshot::Receiver<SleepOutcome>,
}

/// Registers a waiter under `addr` without suspending. See [`SleepTicket`].
/// If `insert_head` is set the waiter is placed at the front of `addr`'s
/// queue instead of the back — used by the condition variable to preserve
/// queue position across a spurious-wake re-wait.
pub fn register(addr: Addr, insert_head: bool) -> SleepTicket {
    let (tx, rx) = oneshot::channel();
    let seq = {
        let mut reg = registry().lock();
        let seq = reg.next_seq;
        reg.next_seq += 1;
        let list = reg.waiters.entry(addr).or_default();
        if insert_head {
            list.insert(0, Waiter { seq, tx });
        } else {
            list.push(Waiter { seq, tx });
        }
        seq
    };
    SleepTicket { addr, seq, rx }
}

impl SleepTicket {
    /// Suspends until the timer elapses, the waiter is canceled, or the
    /// process aborts. `deadline = None` means wait forever.
    pub async fn wait(self, deadline: Option<Instant>) -> SleepOutcome {
        match deadline {
            Some(d) => match tokio::time::timeout_at(d.into(), self.rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => SleepOutcome::Aborted,
                Err(_elapsed) => {
                    remove_waiter(self.addr, self.seq);
                    SleepOutcome::Success
                }
            },
            None => self.rx.await.unwrap_or(SleepOutcome::Aborted),
        }
    }
}

/// Registers a timed wait under `addr` and suspends on it immediately.
/// `deadline = None` means wait forever (only woken by cancel/abort). If
/// `insert_head` is set the waiter is placed at the front of `addr`'s queue
/// instead of the back.
///
/// Callers that need to register the waiter *before* releasing a lock that
/// guards the predicate being waited on (to avoid a lost wakeup) should use
/// [`register`] directly instead of this convenience wrapper.
pub async fn sleep(addr: Addr, deadline: Option<Instant>, insert_head: bool) -> SleepOutcome {
    if let Some(d) = deadline {
        if d <= Instant::now() {
            return SleepOutcome::Success;
        }
    }
    register(addr, insert_head).wait(deadline).await
}

/// Wakes up to `n` waiters on `addr` with [`SleepOutcome::Canceled`], in
/// FIFO order (unless some were inserted at head). Returns how many were
/// actually woken. The lock is dropped before sending so waking never races
/// new registrations on the same address.
pub fn cancel_sleep_by_addr(addr: Addr, n: usize) -> usize {
    let drained: Vec<Waiter> = {
        let mut reg = registry().lock();
        match reg.waiters.get_mut(&addr) {
            Some(list) => {
                let take = n.min(list.len());
                let drained = list.drain(0..take).collect();
                if list.is_empty() {
                    reg.waiters.remove(&addr);
                }
                drained
            }
            None => Vec::new(),
        }
    };
    drained
        .into_iter()
        .filter(|w| w.tx.send(SleepOutcome::Canceled).is_ok())
        .count()
}

/// Wakes every waiter on `addr` with [`SleepOutcome::Aborted`] — used on
/// process-wide shutdown.
pub fn abort_addr(addr: Addr) {
    let drained: Vec<Waiter> = {
        let mut reg = registry().lock();
        reg.waiters.remove(&addr).unwrap_or_default()
    };
    for w in drained {
        let _ = w.tx.send(SleepOutcome::Aborted);
    }
}

pub fn duration_from_now(d: Duration) -> Instant {
    Instant::now() + d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn natural_timeout_returns_success() {
        let addr = fresh_addr();
        let outcome = sleep(addr, Some(duration_from_now(Duration::from_millis(5))), false).await;
        assert_eq!(outcome, SleepOutcome::Success);
    }

    #[tokio::test]
    async fn cancel_wakes_with_canceled() {
        let addr = fresh_addr();
        let waiter = tokio::spawn(async move { sleep(addr, None, false).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let woken = cancel_sleep_by_addr(addr, 1);
        assert_eq!(woken, 1);
        assert_eq!(waiter.await.unwrap(), SleepOutcome::Canceled);
    }

    #[tokio::test]
    async fn cancel_wakes_exactly_requested_count_fifo() {
        let addr = fresh_addr();
        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(tokio::spawn(async move { sleep(addr, None, false).await }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let woken = cancel_sleep_by_addr(addr, 2);
        assert_eq!(woken, 2);
        let remaining = cancel_sleep_by_addr(addr, 100);
        assert_eq!(remaining, 2);

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert!(results.iter().all(|o| *o == SleepOutcome::Canceled));
    }
}
