//! Error handling and types
//!
//! Recoverable outcomes only. Contract violations (unbalanced `mark_done`,
//! registering on a finished group, a zero concurrency limit) are programmer
//! errors and panic at the call site instead.

use std::time::Duration;
use thiserror::Error;

/// Construction and configuration errors
#[derive(Error, Debug)]
pub enum Error {
    /// Standard I/O error, e.g. when a runtime cannot spawn its threads
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration error
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias for construction and configuration
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a coordination group that did not complete successfully
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationError {
    /// The group's deadline elapsed while work units were still outstanding
    #[error("coordination group timed out after {timeout:?} with {pending} unit(s) outstanding")]
    Timeout {
        /// The deadline that elapsed
        timeout: Duration,
        /// Units still registered when the deadline hit
        pending: usize,
    },
}

impl CoordinationError {
    /// Whether this is a deadline failure
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Outcome of racing an operation against a timer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaceError<E> {
    /// The timer won; the operation was cancelled
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The operation finished first but failed; the failure is passed through
    #[error("operation failed: {0}")]
    Operation(#[source] E),
}

impl<E> RaceError<E> {
    /// Whether the timer won the race
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// The operation's own failure, if that is what ended the race
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(err) => Some(err),
            Self::Timeout(_) => None,
        }
    }
}
