//! Logging infrastructure for the ingest path.
//!
//! Events are emitted through `tracing` with target "tonbo". Every event
//! carries a `component` (e.g. "write", "stall", "wal", "flush") and a
//! snake_case `event` field so operators can filter on either.
//!
//! The crate never installs a global subscriber; applications choose one.

/// Target for all ingest log events.
pub(crate) const TONBO_TARGET: &str = "tonbo";

/// Info-level event.
///
/// ```ignore
/// log_info!(
///     component = "wal",
///     event = "log_rotated",
///     segment = %id,
/// );
/// ```
macro_rules! log_info {
    ($($field:tt)*) => {
        ::tracing::info!(target: $crate::observability::TONBO_TARGET, $($field)*)
    };
}

/// Debug-level event.
macro_rules! log_debug {
    ($($field:tt)*) => {
        ::tracing::debug!(target: $crate::observability::TONBO_TARGET, $($field)*)
    };
}

/// Warn-level event.
macro_rules! log_warn {
    ($($field:tt)*) => {
        ::tracing::warn!(target: $crate::observability::TONBO_TARGET, $($field)*)
    };
}

/// Error-level event.
macro_rules! log_error {
    ($($field:tt)*) => {
        ::tracing::error!(target: $crate::observability::TONBO_TARGET, $($field)*)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
