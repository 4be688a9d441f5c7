//! Named-queue offload onto the blocking thread pool: the equivalent of
//! switching the calling coroutine to a dedicated worker thread for
//! CPU-bound or blocking work, then resuming with the result.
//!
//! There's no custom thread pool here — `tokio`'s blocking pool already
//! does the scheduling — but every call is tagged with a logical queue
//! name so traces group by "what kind of work" rather than by raw task id.

use crate::error::{CoreError, ErrorKind};

/// Default queue name used by [`switch_go_thread`] when the caller doesn't
/// pick one.
pub const GO_DEFAULT_QUEUE: &str = "coro:go";

/// Runs `f` on the blocking thread pool under the named `queue`, returning
/// its result once complete. A panic inside `f` is reported as a
/// [`CoreError`] rather than propagated, so a misbehaving offloaded closure
/// can't silently poison the caller's task.
pub async fn go<F, T>(queue: &str, f: F) -> Result<T, CoreError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let queue_name = queue.to_string();
    let span_queue = queue_name.clone();
    let join = tokio::task::spawn_blocking(move || {
        let span = tracing::info_span!("coro_core::coroutine::go", queue = %span_queue);
        let _enter = span.enter();
        f()
    })
    .await;

    join.map_err(|e| CoreError::new(ErrorKind::TaskError, format!("go queue '{queue_name}' panicked: {e}")))
}

/// Switches to `queue`'s worker and back without doing any work of its
/// own — a scheduling checkpoint that groups under `queue` for tracing,
/// mirroring a bare `switch_go_thread` call.
pub async fn switch_go_thread(queue: &str) -> Result<(), CoreError> {
    go(queue, || ()).await
}

/// [`switch_go_thread`] against [`GO_DEFAULT_QUEUE`].
pub async fn switch_go_thread_default() -> Result<(), CoreError> {
    switch_go_thread(GO_DEFAULT_QUEUE).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn go_runs_closure_and_returns_value() {
        let result = go("test:queue", || 2 + 2).await.unwrap();
        assert_eq!(result, 4);
    }

    #[tokio::test]
    async fn go_reports_panic_as_core_error() {
        let err = go("test:queue", || -> i32 { panic!("boom") }).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TaskError);
    }

    #[tokio::test]
    async fn switch_go_thread_completes() {
        switch_go_thread_default().await.unwrap();
    }
}
