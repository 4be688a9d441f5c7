//! Future / Promise — a single-shot value cell with cancellation and
//! callback hooks, plus [`detach_task`], the glue between a spawned
//! coroutine's result and a promise.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::coroutine::sleep::{self, Addr, SleepOutcome};
use crate::error::CoreError;

/// The state a [`SharedFuture`] can be observed in. `Timeout` is transient
/// and read-only: it's what `wait_for` returns on a local deadline, not a
/// state stored in the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    NotSet,
    Ready,
    Timeout,
    Aborted,
    Broken,
    Exception,
}

enum Slot<T> {
    NotSet,
    Ready(T),
    Aborted,
    Broken,
    Exception(Arc<CoreError>),
}

impl<T> Slot<T> {
    fn state(&self) -> FutureState {
        match self {
            Slot::NotSet => FutureState::NotSet,
            Slot::Ready(_) => FutureState::Ready,
            Slot::Aborted => FutureState::Aborted,
            Slot::Broken => FutureState::Broken,
            Slot::Exception(_) => FutureState::Exception,
        }
    }
}

type Callback<T> = Box<dyn FnOnce(FutureState, Option<&T>) + Send>;

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    callback: Mutex<Option<Callback<T>>>,
    addr: Addr,
}

impl<T> Shared<T> {
    fn set_once(&self, value: Slot<T>) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::NotSet) {
            return false;
        }
        *slot = value;
        drop(slot);
        if let Some(cb) = self.callback.lock().take() {
            let slot = self.slot.lock();
            match &*slot {
                Slot::Ready(v) => cb(FutureState::Ready, Some(v)),
                other => cb(other.state(), None),
            }
        }
        sleep::cancel_sleep_by_addr(self.addr, usize::MAX);
        true
    }
}

/// The producer side. Dropping a `Promise` without setting a value
/// transitions the future to `BROKEN`.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
    consumed: bool,
}

impl<T: Send + 'static> Promise<T> {
    pub fn new() -> (Self, SharedFuture<T>) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::NotSet),
            callback: Mutex::new(None),
            addr: sleep::fresh_addr(),
        });
        (
            Promise {
                shared: Arc::clone(&shared),
                consumed: false,
            },
            SharedFuture { shared },
        )
    }

    pub fn set_value(mut self, value: T) {
        self.shared.set_once(Slot::Ready(value));
        self.consumed = true;
    }

    pub fn set_exception(mut self, err: CoreError) {
        self.shared.set_once(Slot::Exception(Arc::new(err)));
        self.consumed = true;
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.consumed {
            self.shared.set_once(Slot::Broken);
        }
    }
}

/// The consumer side. Cheaply cloneable; every clone observes the same
/// single-shot value.
pub struct SharedFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> SharedFuture<T> {
    pub fn state(&self) -> FutureState {
        self.shared.slot.lock().state()
    }

    /// Waits for the value, forever.
    pub async fn wait(&self) -> Result<T, CoreError>
    where
        T: Clone,
    {
        self.wait_deadline(None).await
    }

    pub async fn wait_for(&self, deadline: Instant) -> Result<T, CoreError>
    where
        T: Clone,
    {
        self.wait_deadline(Some(deadline)).await
    }

    async fn wait_deadline(&self, deadline: Option<Instant>) -> Result<T, CoreError>
    where
        T: Clone,
    {
        loop {
            match &*self.shared.slot.lock() {
                Slot::Ready(v) => return Ok(v.clone()),
                Slot::Aborted => return Err(CoreError::aborted()),
                Slot::Broken => {
                    return Err(CoreError::new(crate::error::ErrorKind::Closed, "promise was dropped without a value (BROKEN)"));
                }
                Slot::Exception(e) => return Err(CoreError::new(e.kind(), e.message().to_string())),
                Slot::NotSet => {}
            }
            let outcome = sleep::sleep(self.shared.addr, deadline, false).await;
            match outcome {
                SleepOutcome::Success => return Err(CoreError::timeout()),
                SleepOutcome::Aborted => return Err(CoreError::aborted()),
                SleepOutcome::Canceled => continue,
            }
        }
    }

    /// Registers a callback that fires once, synchronously if the value is
    /// already set, or exactly once at set-time otherwise.
    pub fn set_callback(&self, cb: impl FnOnce(FutureState, Option<&T>) + Send + 'static) {
        let slot = self.shared.slot.lock();
        if !matches!(*slot, Slot::NotSet) {
            match &*slot {
                Slot::Ready(v) => cb(FutureState::Ready, Some(v)),
                other => cb(other.state(), None),
            }
            return;
        }
        drop(slot);
        *self.shared.callback.lock() = Some(Box::new(cb));
    }
}

/// Glues a coroutine's fallible result into a promise: `Ok` becomes
/// `Ready`, `Err` becomes `EXCEPTION`.
pub fn detach_task<T, E, F>(promise: Promise<T>, task: F)
where
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    F: Future<Output = Result<T, E>> + Send + 'static,
{
    crate::coroutine::spawn_detached(async move {
        match task.await {
            Ok(value) => promise.set_value(value),
            Err(err) => promise.set_exception(
                CoreError::new(crate::error::ErrorKind::TaskError, err.to_string()).with_cause(err),
            ),
        }
    });
}
