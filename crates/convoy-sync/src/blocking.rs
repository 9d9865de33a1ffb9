//! Thread-blocking counting semaphore
//!
//! Only for callers prepared to dedicate a thread to the wait: worker threads
//! of a blocking pool, plain `std::thread`s, or synchronous dispatcher work.
//! Calling [`BlockingSemaphore::wait`] from an async task stalls the executor.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

/// A counting semaphore whose `wait` blocks the calling thread
///
/// The count never goes negative: `wait` only decrements once a permit is
/// available. `signal` increments and releases exactly one blocked thread, in
/// no particular order.
///
/// # Example
///
/// ```rust
/// use convoy_sync::BlockingSemaphore;
///
/// let mutex = BlockingSemaphore::default();
/// mutex.wait();
/// assert!(!mutex.try_wait());
/// mutex.signal();
/// assert_eq!(mutex.available_permits(), 1);
/// ```
#[derive(Clone)]
pub struct BlockingSemaphore {
    /// Shared state between all clones
    inner: Arc<BlockingInner>,
}

/// A [`BlockingSemaphore`] used as a one-shot or repeating event gate
///
/// Construct with [`BlockingSemaphore::gate`] so nothing passes until the first
/// `signal`.
pub type Gate = BlockingSemaphore;

/// State behind a [`BlockingSemaphore`]
struct BlockingInner {
    /// Available permits
    permits: Mutex<usize>,
    /// Signalled once per released permit
    available: Condvar,
}

impl BlockingSemaphore {
    /// Create a semaphore with `permits` initial permits
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(BlockingInner {
                permits: Mutex::new(permits),
                available: Condvar::new(),
            }),
        }
    }

    /// Create a closed event gate (zero permits)
    ///
    /// # Example
    ///
    /// ```rust
    /// use convoy_sync::BlockingSemaphore;
    /// use std::time::Duration;
    ///
    /// let gate = BlockingSemaphore::gate();
    /// assert!(!gate.wait_timeout(Duration::from_millis(5)));
    /// gate.signal();
    /// assert!(gate.wait_timeout(Duration::from_millis(5)));
    /// ```
    #[must_use]
    pub fn gate() -> Self {
        Self::new(0)
    }

    /// Lock the permit count, ignoring poisoning
    fn permits(&self) -> MutexGuard<'_, usize> {
        self.inner
            .permits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a permit is available, then take it
    pub fn wait(&self) {
        let mut permits = self.permits();
        while *permits == 0 {
            permits = self
                .inner
                .available
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    /// Block for at most `timeout` waiting for a permit
    ///
    /// Returns `true` if a permit was taken. On timeout nothing changes and
    /// `false` is returned.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits();
        loop {
            if *permits > 0 {
                *permits -= 1;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                trace!(?timeout, "blocking wait timed out");
                return false;
            }
            let (guard, _) = self
                .inner
                .available
                .wait_timeout(permits, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            permits = guard;
        }
    }

    /// Take a permit if one is free, without blocking
    #[must_use]
    pub fn try_wait(&self) -> bool {
        let mut permits = self.permits();
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    /// Block for a permit and return a guard that signals on drop
    #[must_use]
    pub fn acquire(&self) -> BlockingPermit {
        self.wait();
        BlockingPermit {
            semaphore: self.clone(),
        }
    }

    /// Return one permit and release one blocked thread, if any
    pub fn signal(&self) {
        let mut permits = self.permits();
        *permits += 1;
        drop(permits);
        self.inner.available.notify_one();
    }

    /// Number of permits currently available
    #[must_use]
    pub fn available_permits(&self) -> usize {
        *self.permits()
    }
}

impl Default for BlockingSemaphore {
    /// A single-permit semaphore, usable as a mutual-exclusion gate
    fn default() -> Self {
        Self::new(1)
    }
}

impl std::fmt::Debug for BlockingSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingSemaphore")
            .field("permits", &self.available_permits())
            .finish()
    }
}

/// RAII guard returned by [`BlockingSemaphore::acquire`]
pub struct BlockingPermit {
    /// Semaphore signalled when the permit is dropped
    semaphore: BlockingSemaphore,
}

impl Drop for BlockingPermit {
    fn drop(&mut self) {
        self.semaphore.signal();
    }
}
