//! # Arbiter Error Types
//!
//! Centralized error handling for the lock engine.
//!
//! Every acquisition failure maps to one stable [`LockErrorKind`] so callers
//! can branch on the kind without matching on message text.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{LockId, OwnerId};
use crate::lock::RequestKind;

/// Result type alias for lock operations
pub type Result<T, E = LockError> = std::result::Result<T, E>;

/// Boxed error accepted from `run_exclusive` callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stable, distinguishable error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockErrorKind {
    Deadlock,
    AcquireTimeout,
    Cancelled,
    AcquireFailed,
    ExecutionFailed,
}

impl std::fmt::Display for LockErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Deadlock => "deadlock",
            Self::AcquireTimeout => "acquire_timeout",
            Self::Cancelled => "cancelled",
            Self::AcquireFailed => "acquire_failed",
            Self::ExecutionFailed => "execution_failed",
        };
        f.write_str(name)
    }
}

/// Lock acquisition and execution errors
#[derive(Error, Debug)]
pub enum LockError {
    /// The request would close a wait-for cycle; it was never queued.
    #[error("deadlock detected: {owner} waiting on {lock} closes a cycle")]
    Deadlock { lock: LockId, owner: OwnerId },

    /// A queued request's timer fired before it was granted.
    #[error("{kind} acquisition of {lock} by {owner} timed out after {timeout:?}")]
    AcquireTimeout {
        lock: LockId,
        owner: OwnerId,
        kind: RequestKind,
        timeout: Duration,
    },

    /// An external cancellation signal fired (never retried).
    #[error("acquisition of {lock} by {owner} was cancelled")]
    Cancelled { lock: LockId, owner: OwnerId },

    /// The retry budget was exhausted; wraps the last underlying error.
    #[error("failed to acquire {lock} after {attempts} attempts: {source}")]
    AcquireFailed {
        lock: LockId,
        attempts: u32,
        #[source]
        source: Box<LockError>,
    },

    /// A `run_exclusive` callback failed with an error that was not a lock error.
    #[error("exclusive section on {lock} failed: {source}")]
    ExecutionFailed {
        lock: LockId,
        #[source]
        source: BoxError,
    },
}

impl LockError {
    /// Get the stable kind of this error
    pub fn kind(&self) -> LockErrorKind {
        match self {
            Self::Deadlock { .. } => LockErrorKind::Deadlock,
            Self::AcquireTimeout { .. } => LockErrorKind::AcquireTimeout,
            Self::Cancelled { .. } => LockErrorKind::Cancelled,
            Self::AcquireFailed { .. } => LockErrorKind::AcquireFailed,
            Self::ExecutionFailed { .. } => LockErrorKind::ExecutionFailed,
        }
    }

    /// Whether a backoff loop may retry after this error.
    ///
    /// Retrying a deadlocked request without releasing anything cannot
    /// succeed, so `Deadlock` is treated like `Cancelled`.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Deadlock { .. } | Self::Cancelled { .. } | Self::ExecutionFailed { .. }
        )
    }

    /// Innermost error, looking through `AcquireFailed` wrappers
    pub fn root(&self) -> &LockError {
        match self {
            Self::AcquireFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classify a callback error: lock errors pass through unchanged,
    /// anything else becomes `ExecutionFailed`.
    pub(crate) fn from_callback(lock: LockId, err: BoxError) -> Self {
        match err.downcast::<LockError>() {
            Ok(lock_err) => *lock_err,
            Err(source) => Self::ExecutionFailed { lock, source },
        }
    }
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid value for {var}: '{value}'")]
    Env { var: String, value: String },

    #[error("validation error: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (LockId, OwnerId) {
        (LockId::from_raw(1), OwnerId::new(7))
    }

    #[test]
    fn test_kind_mapping() {
        let (lock, owner) = ids();
        assert_eq!(LockError::Deadlock { lock, owner }.kind(), LockErrorKind::Deadlock);
        assert_eq!(LockError::Cancelled { lock, owner }.kind(), LockErrorKind::Cancelled);
        let timeout = LockError::AcquireTimeout {
            lock,
            owner,
            kind: RequestKind::Exclusive,
            timeout: Duration::from_millis(10),
        };
        assert_eq!(timeout.kind(), LockErrorKind::AcquireTimeout);
    }

    #[test]
    fn test_retryable() {
        let (lock, owner) = ids();
        assert!(!LockError::Deadlock { lock, owner }.is_retryable());
        assert!(!LockError::Cancelled { lock, owner }.is_retryable());
        assert!(LockError::AcquireTimeout {
            lock,
            owner,
            kind: RequestKind::Read,
            timeout: Duration::from_millis(1),
        }
        .is_retryable());
    }

    #[test]
    fn test_root_unwraps_acquire_failed() {
        let (lock, owner) = ids();
        let err = LockError::AcquireFailed {
            lock,
            attempts: 3,
            source: Box::new(LockError::AcquireTimeout {
                lock,
                owner,
                kind: RequestKind::Write,
                timeout: Duration::from_millis(5),
            }),
        };
        assert_eq!(err.kind(), LockErrorKind::AcquireFailed);
        assert_eq!(err.root().kind(), LockErrorKind::AcquireTimeout);
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn test_from_callback_classification() {
        let (lock, owner) = ids();
        let passthrough: BoxError = Box::new(LockError::Deadlock { lock, owner });
        assert_eq!(
            LockError::from_callback(lock, passthrough).kind(),
            LockErrorKind::Deadlock
        );

        let foreign: BoxError = "disk full".into();
        let err = LockError::from_callback(lock, foreign);
        assert_eq!(err.kind(), LockErrorKind::ExecutionFailed);
        assert!(err.to_string().contains("disk full"));
    }
}
