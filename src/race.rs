//! Racing an operation against a timer
//!
//! Whichever side finishes first decides the outcome. When the timer wins the
//! operation's [`CancelFlag`] is raised and the operation is dropped at its
//! current suspension point; work it handed to other threads is expected to
//! poll the flag at its own checkpoints.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::RaceError;
use crate::registry::ExecutionContext;

/// Cooperative cancellation signal handed to raced operations
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Flag in the raised-never state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the operation lost its race and should stop
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Raise the flag; every clone observes it
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Race `operation` against `timeout` on the current task
///
/// # Errors
///
/// Returns [`RaceError::Timeout`] if the timer fires first, or
/// [`RaceError::Operation`] with the operation's own failure.
pub async fn race<F, Fut, T, E>(timeout: Duration, operation: F) -> Result<T, RaceError<E>>
where
    F: FnOnce(CancelFlag) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let flag = CancelFlag::new();
    let work = operation(flag.clone());

    tokio::select! {
        biased;
        outcome = work => outcome.map_err(RaceError::Operation),
        () = tokio::time::sleep(timeout) => {
            flag.cancel();
            debug!(?timeout, "timer won race, operation cancelled");
            Err(RaceError::Timeout(timeout))
        }
    }
}

/// Race `operation` spawned on `context` against `timeout`
///
/// The operation runs in parallel with the caller. A losing operation is
/// flagged and aborted.
///
/// # Errors
///
/// Same as [`race`].
///
/// # Panics
///
/// Re-raises a panic from the operation, and panics if the context shuts down
/// before the operation finishes.
pub async fn race_on<F, Fut, T, E>(
    context: &ExecutionContext,
    timeout: Duration,
    operation: F,
) -> Result<T, RaceError<E>>
where
    F: FnOnce(CancelFlag) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let flag = CancelFlag::new();
    let mut task = context.spawn(operation(flag.clone()));

    tokio::select! {
        biased;
        joined = &mut task => match joined {
            Ok(outcome) => outcome.map_err(RaceError::Operation),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => panic!(
                "execution context `{}` shut down before the raced operation finished",
                context.label()
            ),
        },
        () = tokio::time::sleep(timeout) => {
            flag.cancel();
            task.abort();
            debug!(?timeout, context = context.label(), "timer won race, spawned operation aborted");
            Err(RaceError::Timeout(timeout))
        }
    }
}
