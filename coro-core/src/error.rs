//! Unified error domain for the runtime.
//!
//! A stable `ErrorKind` plus a free-text message and an optional boxed
//! cause, so logging/metrics can key off `kind()` while humans read
//! `message()`.

use std::fmt;

/// Boxed source error, kept `Send + Sync` so it can cross task boundaries.
pub type ErrorCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The timing/IO/protocol result codes used across the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation completed normally.
    Success,
    /// A deadline elapsed before the operation completed.
    Timeout,
    /// The runtime is tearing down; all waiters are woken with this code.
    Aborted,
    /// A container (deque, future) was closed/broken.
    Closed,
    /// An underlying OS/transport error occurred (errno-like).
    SysError,
    /// TLS handshake or record layer failure.
    SslError,
    /// DNS resolution failure.
    DnsError,
    /// A higher-level protocol violation (malformed response, etc).
    TaskError,
    /// Caller passed a value that breaks a documented invariant.
    InvalidInput,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Success => "success",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Closed => "closed",
            ErrorKind::SysError => "sys_error",
            ErrorKind::SslError => "ssl_error",
            ErrorKind::DnsError => "dns_error",
            ErrorKind::TaskError => "task_error",
            ErrorKind::InvalidInput => "invalid_input",
        };
        f.write_str(s)
    }
}

/// The runtime's unified error type.
///
/// Every fallible public API in `coro-core` (and `coro-redis`, which wraps
/// this type rather than inventing its own) returns `Result<_, CoreError>`.
#[derive(Debug, thiserror::Error)]
#[error("[{kind}] {message}")]
pub struct CoreError {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<ErrorCause>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "operation timed out")
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, "runtime is shutting down")
    }

    pub fn closed() -> Self {
        Self::new(ErrorKind::Closed, "container is closed")
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// True for conditions retries are generally worth attempting against.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::SysError | ErrorKind::Timeout)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
