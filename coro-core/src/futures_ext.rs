//! Small future/stream type aliases shared across the crate. Plain `std`
//! throughout, since the substrate this runtime sits on is a threaded
//! executor rather than an embedded target.

use std::future::Future;
use std::pin::Pin;

/// A boxed, `Send` future — the common currency for trait-object returning
/// async APIs (`AwaiterBase::suspend`, `TaskHandle::join`, ...).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed future without a `Send` bound, for callers pinned to one thread.
pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;
