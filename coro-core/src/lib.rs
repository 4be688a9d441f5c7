//! Coroutine-flavored concurrency runtime built on `tokio`: address-keyed
//! synchronization primitives, a couple of small data structures, a
//! single-flight cache, and a name-service address pool with pluggable
//! weighted selection policies.

pub mod cache;
pub mod cli;
pub mod collections;
pub mod config;
pub mod coroutine;
pub mod error;
pub mod futures_ext;
pub mod ns;
pub mod observability;
pub mod sync;

pub use error::{CoreError, CoreResult, ErrorKind};
pub use observability::{LogField, LogSeverity, Logger};
