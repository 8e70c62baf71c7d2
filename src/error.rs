use std::{
    fmt, io,
    sync::{Arc, Mutex},
};

use thiserror::Error;

use crate::observability::log_error;

/// Result type shared across the write path.
pub type WriteResult<T> = Result<T, WriteError>;

/// How badly a durability failure damaged the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// The engine turns read-only until [`crate::Db::resume`] succeeds.
    Recoverable,
    /// The engine rejects every write until it is reopened.
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Recoverable => write!(f, "recoverable"),
            Severity::Fatal => write!(f, "fatal"),
        }
    }
}

/// Errors surfaced to writers.
///
/// Every member of a write group receives a clone of the same error, so the
/// type stays cheap to clone (I/O causes are shared behind an `Arc`).
#[derive(Debug, Clone, Error)]
pub enum WriteError {
    /// The request is contradictory or names something that does not exist.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Admission refused a writer that asked not to be slowed down.
    #[error("operation incomplete: {0}")]
    Incomplete(&'static str),
    /// The durability medium failed.
    #[error("{severity} log io error while trying to {action}: {source}")]
    Io {
        /// Classification of the failure.
        severity: Severity,
        /// What the log writer was doing.
        action: &'static str,
        /// Underlying medium error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The engine is closing and no longer admits writers.
    #[error("engine is shutting down")]
    ShutdownInProgress,
    /// The leader of the group was dropped before the group committed.
    #[error("write group was aborted before it committed")]
    Aborted,
}

impl WriteError {
    pub(crate) fn io(severity: Severity, action: &'static str, err: io::Error) -> Self {
        WriteError::Io {
            severity,
            action,
            source: Arc::new(err),
        }
    }

    /// Severity of an I/O failure, `None` for every other kind.
    pub fn severity(&self) -> Option<Severity> {
        match self {
            WriteError::Io { severity, .. } => Some(*severity),
            _ => None,
        }
    }

    /// True when the writer was refused rather than failed.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, WriteError::Incomplete(_))
    }

    /// True for contradictory or malformed requests.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, WriteError::InvalidRequest(_))
    }
}

/// Sticky engine-level error set by failed log writes.
///
/// Recoverable errors may be cleared by a resume; a fatal one never is.
#[derive(Debug, Default)]
pub(crate) struct ErrorState {
    current: Mutex<Option<WriteError>>,
}

impl ErrorState {
    /// Fail fast if the engine is read-only or dead.
    pub(crate) fn check(&self) -> WriteResult<()> {
        match self.current.lock().expect("error state poisoned").as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn current(&self) -> Option<WriteError> {
        self.current.lock().expect("error state poisoned").clone()
    }

    /// Remember `err` if it is an I/O failure at least as severe as the one
    /// already recorded.
    pub(crate) fn record(&self, err: &WriteError) {
        let Some(severity) = err.severity() else {
            return;
        };
        let mut guard = self.current.lock().expect("error state poisoned");
        let replace = match guard.as_ref().and_then(WriteError::severity) {
            Some(existing) => severity > existing,
            None => true,
        };
        if replace {
            log_error!(
                component = "write",
                event = "engine_error_recorded",
                severity = %severity,
                error = %err,
            );
            *guard = Some(err.clone());
        }
    }

    /// Drop a recoverable error. A fatal error is returned instead.
    pub(crate) fn clear_recoverable(&self) -> WriteResult<()> {
        let mut guard = self.current.lock().expect("error state poisoned");
        match guard.as_ref() {
            Some(err) if err.severity() == Some(Severity::Fatal) => Err(err.clone()),
            _ => {
                *guard = None;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_err(severity: Severity) -> WriteError {
        WriteError::io(severity, "append", io::Error::other("medium gone"))
    }

    #[test]
    fn fatal_error_is_never_downgraded() {
        let state = ErrorState::default();
        state.record(&io_err(Severity::Fatal));
        state.record(&io_err(Severity::Recoverable));
        let err = state.check().expect_err("engine must stay failed");
        assert_eq!(err.severity(), Some(Severity::Fatal));
        assert!(state.clear_recoverable().is_err());
    }

    #[test]
    fn recoverable_error_clears() {
        let state = ErrorState::default();
        state.record(&io_err(Severity::Recoverable));
        assert!(state.check().is_err());
        state.clear_recoverable().expect("recoverable");
        state.check().expect("cleared");
    }

    #[test]
    fn non_io_errors_are_not_sticky() {
        let state = ErrorState::default();
        state.record(&WriteError::Incomplete("stalled"));
        state.record(&WriteError::InvalidRequest("bad".into()));
        state.check().expect("nothing recorded");
    }
}
