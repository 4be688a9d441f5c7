//! Observability facade.
//!
//! Subsystems never call `tracing` macros directly from business logic that
//! needs to stay host-pluggable (NS policy transitions, handshake stages);
//! instead they go through [`Logger`], an object-safe trait with a default
//! implementation backed by `tracing`, so a host can swap sinks without
//! touching call sites.

use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogSeverity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A single structured field attached to a log record.
#[derive(Debug, Clone)]
pub struct LogField {
    pub key: &'static str,
    pub value: String,
}

impl LogField {
    pub fn new(key: &'static str, value: impl fmt::Display) -> Self {
        Self {
            key,
            value: value.to_string(),
        }
    }
}

/// Object-safe logging sink. Implementors decide where records go.
pub trait Logger: Send + Sync + 'static {
    fn log(&self, severity: LogSeverity, target: &str, message: &str, fields: &[LogField]);
}

/// Default `Logger` that forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, severity: LogSeverity, target: &str, message: &str, fields: &[LogField]) {
        let rendered: Vec<String> = fields.iter().map(|f| format!("{}={}", f.key, f.value)).collect();
        let joined = rendered.join(" ");
        match severity {
            LogSeverity::Trace => tracing::trace!(target: "coro_core", %target, %message, %joined),
            LogSeverity::Debug => tracing::debug!(target: "coro_core", %target, %message, %joined),
            LogSeverity::Info => tracing::info!(target: "coro_core", %target, %message, %joined),
            LogSeverity::Warn => tracing::warn!(target: "coro_core", %target, %message, %joined),
            LogSeverity::Error => tracing::error!(target: "coro_core", %target, %message, %joined),
        }
    }
}

/// Shared handle to the process-wide logger, set once at startup.
static LOGGER: parking_lot::RwLock<Option<Arc<dyn Logger>>> = parking_lot::RwLock::new(None);

/// Installs the process-wide logger. Subsequent calls are ignored once a
/// logger has already been installed — first writer wins.
pub fn install_logger(logger: Arc<dyn Logger>) {
    let mut slot = LOGGER.write();
    if slot.is_none() {
        *slot = Some(logger);
    }
}

pub fn logger() -> Arc<dyn Logger> {
    let slot = LOGGER.read();
    match slot.as_ref() {
        Some(logger) => Arc::clone(logger),
        None => Arc::new(TracingLogger) as Arc<dyn Logger>,
    }
}

#[macro_export]
macro_rules! log_event {
    ($sev:expr, $target:expr, $msg:expr $(, $k:expr => $v:expr)* $(,)?) => {{
        let fields = [$($crate::observability::LogField::new($k, $v)),*];
        $crate::observability::logger().log($sev, $target, $msg, &fields);
    }};
}
