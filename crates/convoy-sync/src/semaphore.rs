//! Suspension-based semaphore with FIFO hand-off
//!
//! Callers that cannot block a thread suspend on [`CooperativeSemaphore::wait`]
//! instead. When a permit is signalled while callers are suspended, the permit
//! is handed straight to the oldest waiter; the available count never moves in
//! that case, so a late arrival can never barge ahead of a queued waiter.
//!
//! # Example
//!
//! ```rust,no_run
//! use convoy_sync::CooperativeSemaphore;
//!
//! # async fn example() {
//! // Event gate: nothing may pass until someone signals
//! let gate = CooperativeSemaphore::new(0);
//!
//! let opener = gate.clone();
//! std::thread::spawn(move || opener.signal());
//!
//! gate.wait().await;
//! # }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use tracing::trace;

/// An executor-agnostic counting semaphore for suspension-based callers
///
/// # Design
///
/// - **Single lock**: the count and the waiter queue live under one mutex, so
///   "waiters is non-empty only while the count is zero" holds at every unlock
/// - **FIFO hand-off**: `signal` resumes the head waiter and gives it the permit
///   directly
/// - **Cancellation safe**: a dropped waiter leaves the queue, or forwards a
///   permit it was already handed
/// - **Cloneable**: clones share the same permits
///
/// # Example
///
/// ```rust,no_run
/// use convoy_sync::CooperativeSemaphore;
///
/// # async fn example() {
/// let sem = CooperativeSemaphore::new(2);
///
/// sem.wait().await;
/// // ... guarded work ...
/// sem.signal();
///
/// // Or let a guard do the signalling
/// let permit = sem.acquire().await;
/// drop(permit);
/// # }
/// ```
#[derive(Clone)]
pub struct CooperativeSemaphore {
    /// Shared state between all clones of this semaphore
    inner: Arc<SemaphoreInner>,
}

/// State behind a [`CooperativeSemaphore`]
struct SemaphoreInner {
    /// Count and waiter queue under one lock
    state: Mutex<SemaphoreState>,
}

/// Permits and waiters, always updated together
struct SemaphoreState {
    /// Permits not handed to anyone
    permits: usize,
    /// Suspended callers, oldest first
    waiters: VecDeque<Arc<Waiter>>,
}

/// One suspended caller
struct Waiter {
    /// Set under the state lock when `signal` hands this waiter a permit
    granted: AtomicBool,
    /// Waker from the most recent poll
    waker: Mutex<Option<Waker>>,
}

impl Waiter {
    /// Waiter that will wake `waker` when granted
    fn new(waker: Waker) -> Self {
        Self {
            granted: AtomicBool::new(false),
            waker: Mutex::new(Some(waker)),
        }
    }

    /// Wake the suspended task, if it registered a waker
    fn wake(&self) {
        let waker = lock(&self.waker).take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Lock ignoring poisoning; state is updated atomically under the lock
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CooperativeSemaphore {
    /// Create a semaphore with the given number of initial permits
    ///
    /// Zero is allowed and yields a pure event gate.
    ///
    /// # Example
    ///
    /// ```rust
    /// use convoy_sync::CooperativeSemaphore;
    ///
    /// let sem = CooperativeSemaphore::new(1024);
    /// assert_eq!(sem.available_permits(), 1024);
    /// ```
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                state: Mutex::new(SemaphoreState {
                    permits,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Take a permit, suspending the calling task until one is handed over
    ///
    /// Waiters are resumed strictly in the order they suspended.
    pub async fn wait(&self) {
        WaitFuture {
            semaphore: self,
            waiter: None,
            acquired: false,
        }
        .await;
    }

    /// Take a permit and return a guard that signals when dropped
    pub async fn acquire(&self) -> SemaphorePermit {
        self.wait().await;
        SemaphorePermit {
            semaphore: self.clone(),
        }
    }

    /// Take a permit without suspending
    ///
    /// Fails whenever the count is zero, even if the caller would be next in
    /// line, so it never overtakes a queued waiter.
    ///
    /// # Example
    ///
    /// ```rust
    /// use convoy_sync::CooperativeSemaphore;
    ///
    /// let sem = CooperativeSemaphore::new(1);
    /// assert!(sem.try_wait());
    /// assert!(!sem.try_wait());
    /// ```
    #[must_use]
    pub fn try_wait(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if state.permits > 0 {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Release one permit
    ///
    /// Resumes the oldest suspended waiter if there is one; otherwise the
    /// available count grows by one.
    pub fn signal(&self) {
        let woken = {
            let mut state = lock(&self.inner.state);
            Self::release_locked(&mut state)
        };
        if let Some(waiter) = woken {
            waiter.wake();
        }
    }

    /// Release `count` permits, one `signal` at a time
    pub fn add_permits(&self, count: usize) {
        for _ in 0..count {
            self.signal();
        }
    }

    /// Number of permits currently available
    ///
    /// Useful for monitoring; the value may change immediately after reading.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        lock(&self.inner.state).permits
    }

    /// Number of callers currently suspended in `wait`
    #[must_use]
    pub fn waiting(&self) -> usize {
        lock(&self.inner.state).waiters.len()
    }

    /// Hand a permit to the head waiter or bank it; must hold the state lock
    fn release_locked(state: &mut SemaphoreState) -> Option<Arc<Waiter>> {
        match state.waiters.pop_front() {
            Some(waiter) => {
                waiter.granted.store(true, Ordering::Release);
                trace!(remaining = state.waiters.len(), "handing permit to waiter");
                Some(waiter)
            }
            None => {
                state.permits += 1;
                None
            }
        }
    }
}

impl std::fmt::Debug for CooperativeSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("CooperativeSemaphore")
            .field("permits", &state.permits)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// RAII guard returned by [`CooperativeSemaphore::acquire`]
///
/// Dropping it signals the semaphore.
pub struct SemaphorePermit {
    /// Semaphore signalled when the permit is dropped
    semaphore: CooperativeSemaphore,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.semaphore.signal();
    }
}

/// Future behind [`CooperativeSemaphore::wait`]
///
/// 1. First poll takes a free permit, or enqueues a waiter and suspends
/// 2. Later polls complete once `signal` marked the waiter as granted
/// 3. Dropping it early dequeues the waiter or forwards a granted permit
struct WaitFuture<'a> {
    /// Semaphore being waited on
    semaphore: &'a CooperativeSemaphore,
    /// Queued waiter, once the first poll found no permit
    waiter: Option<Arc<Waiter>>,
    /// Whether a permit was taken and now belongs to the caller
    acquired: bool,
}

impl Future for WaitFuture<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(waiter) = &self.waiter {
            if waiter.granted.load(Ordering::Acquire) {
                self.waiter = None;
                self.acquired = true;
                return Poll::Ready(());
            }

            *lock(&waiter.waker) = Some(cx.waker().clone());

            // Re-check after publishing the new waker; `signal` sets the flag
            // before taking the waker, so one of the two sides sees the other.
            if waiter.granted.load(Ordering::Acquire) {
                self.waiter = None;
                self.acquired = true;
                return Poll::Ready(());
            }
            return Poll::Pending;
        }

        let mut state = lock(&self.semaphore.inner.state);
        if state.permits > 0 {
            state.permits -= 1;
            drop(state);
            self.acquired = true;
            return Poll::Ready(());
        }

        let waiter = Arc::new(Waiter::new(cx.waker().clone()));
        state.waiters.push_back(Arc::clone(&waiter));
        drop(state);
        self.waiter = Some(waiter);
        Poll::Pending
    }
}

impl Drop for WaitFuture<'_> {
    fn drop(&mut self) {
        if self.acquired {
            return;
        }
        let Some(waiter) = self.waiter.take() else {
            return;
        };

        let woken = {
            let mut state = lock(&self.semaphore.inner.state);
            if waiter.granted.load(Ordering::Acquire) {
                // Handed a permit we will never use: pass it on
                CooperativeSemaphore::release_locked(&mut state)
            } else {
                state.waiters.retain(|queued| !Arc::ptr_eq(queued, &waiter));
                None
            }
        };
        if let Some(next) = woken {
            next.wake();
        }
    }
}
