//! Suspension protocol.
//!
//! Rust's `async fn` already compiles to the state machine a hand-rolled
//! coroutine frame would need, so this module doesn't reimplement coroutine
//! frames. What it *does* provide is the substrate-facing half of the
//! contract: a [`Series`] (ordered FIFO task queue a coroutine's `Awaiter`s
//! attach themselves to), a [`SubTask`] trait for substrate work items, and
//! [`Awaiter`], the `Future` that binds a `SubTask` to the awaiting
//! coroutine through a `ready`/`suspend`/`resume` triad.
//!
//! "Current series" is modeled as task-local context: `tokio::task_local!`
//! follows a task across executor threads the way a plain thread-local
//! cannot, which matters once a coroutine can resume on a different worker
//! thread than the one that suspended it.

pub mod go;
pub mod sleep;

use crate::futures_ext::BoxFuture;
use std::cell::Cell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// The substrate's unit of work. A task runs to completion and may, as part
/// of running, enqueue more tasks onto the series it was given.
#[async_trait::async_trait]
pub trait SubTask: Send + 'static {
    async fn dispatch(self: Box<Self>, series: Series);
}

/// Adapts a plain async closure into a [`SubTask`].
pub struct FnSubTask<F> {
    f: Option<F>,
}

impl<F, Fut> FnSubTask<F>
where
    F: FnOnce(Series) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(f: F) -> Box<dyn SubTask> {
        Box::new(Self { f: Some(f) })
    }
}

#[async_trait::async_trait]
impl<F, Fut> SubTask for FnSubTask<F>
where
    F: FnOnce(Series) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn dispatch(mut self: Box<Self>, series: Series) {
        if let Some(f) = self.f.take() {
            f(series).await;
        }
    }
}

struct SeriesInner {
    queue: Mutex<VecDeque<Box<dyn SubTask>>>,
    draining: AtomicBool,
}

/// An ordered FIFO sequence of tasks. Cloning a `Series` shares the same
/// underlying queue — it is a handle, like `Arc`.
#[derive(Clone)]
pub struct Series {
    inner: Arc<SeriesInner>,
}

impl Series {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SeriesInner {
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn push_back(&self, task: Box<dyn SubTask>) {
        self.inner.queue.lock().unwrap().push_back(task);
        self.kick();
    }

    pub fn push_front(&self, task: Box<dyn SubTask>) {
        self.inner.queue.lock().unwrap().push_front(task);
        self.kick();
    }

    /// Starts (or resumes) draining the queue if nobody else is. Tasks
    /// within a single series run one at a time, front to back.
    fn kick(&self) {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let series = self.clone();
        tokio::spawn(async move {
            loop {
                let next = series.inner.queue.lock().unwrap().pop_front();
                match next {
                    Some(task) => {
                        let child = series.clone();
                        task.dispatch(child).await;
                    }
                    None => {
                        series.inner.draining.store(false, Ordering::Release);
                        // Re-check: a push may have raced the drain flag reset.
                        if series.inner.queue.lock().unwrap().is_empty() {
                            break;
                        }
                        if series
                            .inner
                            .draining
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl Default for Series {
    fn default() -> Self {
        Self::new()
    }
}

tokio::task_local! {
    static CURRENT_SERIES: Series;
}

/// Runs `fut` with `series` installed as the task-local "current series",
/// as if a coroutine were running inside it.
pub async fn run_in_series<F: Future>(series: Series, fut: F) -> F::Output {
    CURRENT_SERIES.scope(series, fut).await
}

/// The series the calling coroutine is currently running in, if any.
pub fn current_series() -> Option<Series> {
    CURRENT_SERIES.try_with(Clone::clone).ok()
}

/// Returns the current series, or creates a fresh detached one if none is
/// installed.
pub fn current_series_or_new() -> Series {
    current_series().unwrap_or_default()
}

// --- Stack-overflow guard ------------------------------------------------

thread_local! {
    static FAST_PATH_COUNTER: Cell<u32> = const { Cell::new(0) };
}

const YIELD_EVERY: u32 = 1024;

/// Call from a fast path that would otherwise always complete
/// synchronously (e.g. pushing onto a deque that has room). Every 1024th
/// call forces a single scheduling round-trip so that a long chain of
/// synchronously-resolving awaits can't blow the stack or starve other
/// tasks.
pub async fn guard_yield() {
    let should = FAST_PATH_COUNTER.with(|c| {
        let n = c.get().wrapping_add(1);
        c.set(n);
        n % YIELD_EVERY == 0
    });
    if should {
        tokio::task::yield_now().await;
    }
}

/// Shared slot an `Awaiter` polls and a `SubTask` completes into.
struct ResultSlot<T> {
    value: Mutex<Option<T>>,
    waker: Mutex<Option<Waker>>,
}

impl<T> ResultSlot<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(None),
            waker: Mutex::new(None),
        })
    }

    fn complete(&self, value: T) {
        *self.value.lock().unwrap() = Some(value);
        if let Some(waker) = self.waker.lock().unwrap().take() {
            waker.wake();
        }
    }

    fn take(&self) -> Option<T> {
        self.value.lock().unwrap().take()
    }

    fn register(&self, waker: &Waker) {
        *self.waker.lock().unwrap() = Some(waker.clone());
    }
}

/// Binds a substrate task to the awaiting coroutine. The separate
/// `ready()`/`suspend()`/`resume()` steps a hand-written coroutine would
/// need are folded into a single [`Future::poll`] implementation.
pub struct Awaiter<T> {
    task: Option<Box<dyn SubTask>>,
    slot: Arc<ResultSlot<T>>,
    in_series: bool,
    forced_yield: bool,
}

impl<T: Send + 'static> Awaiter<T> {
    /// The fast path: no subtask attached, resolves immediately.
    pub fn ready(value: T) -> Self {
        let slot = ResultSlot::new();
        slot.complete(value);
        Self {
            task: None,
            slot,
            in_series: true,
            forced_yield: false,
        }
    }

    /// Builds an awaiter bound to `task`; `task` is expected to call
    /// [`complete`](AwaiterCompleter::complete) on the returned completer
    /// exactly once.
    pub fn pending(make_task: impl FnOnce(AwaiterCompleter<T>) -> Box<dyn SubTask>) -> Self {
        let slot = ResultSlot::new();
        let completer = AwaiterCompleter {
            slot: Arc::clone(&slot),
        };
        let task = make_task(completer);
        Self {
            task: Some(task),
            slot,
            in_series: false,
            forced_yield: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.task.is_none()
    }
}

/// Handed to a `SubTask` constructor so it can report completion back into
/// the `Awaiter` it belongs to.
pub struct AwaiterCompleter<T> {
    slot: Arc<ResultSlot<T>>,
}

impl<T> AwaiterCompleter<T> {
    pub fn complete(self, value: T) {
        self.slot.complete(value);
    }
}

impl<T: Send + 'static> Future for Awaiter<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        if let Some(value) = this.slot.take() {
            if !this.forced_yield && {
                let force = FAST_PATH_COUNTER.with(|c| {
                    let n = c.get().wrapping_add(1);
                    c.set(n);
                    n % YIELD_EVERY == 0
                });
                force
            } {
                this.forced_yield = true;
                // Put the value back; we'll hand it out on the very next poll.
                *this.slot.value.lock().unwrap() = Some(value);
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            return Poll::Ready(value);
        }

        if let Some(task) = this.task.take() {
            if !this.in_series {
                let series = current_series_or_new();
                series.push_back(task);
                this.in_series = true;
            }
        }
        this.slot.register(cx.waker());
        Poll::Pending
    }
}

/// Spawns `fut` as a detached coroutine: nobody awaits its result, and the
/// substrate drops the frame once it reaches final suspend. An unhandled
/// panic inside a detached coroutine is promoted to process termination —
/// `tokio` would otherwise swallow it silently.
pub fn spawn_detached<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let handle = tokio::spawn(fut);
        if handle.await.is_err() {
            tracing::error!(target: "coro_core::coroutine", "detached coroutine panicked with an unobserved error; aborting process");
            std::process::abort();
        }
    });
}

/// Box-erases a future for object-safe task handles.
pub fn boxed<'a, F>(fut: F) -> BoxFuture<'a, F::Output>
where
    F: Future + Send + 'a,
{
    Box::pin(fut)
}
