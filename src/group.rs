//! Fan-out / fan-in with an optional deadline
//!
//! A [`CoordinationGroup`] counts outstanding work units. Each unit is
//! registered before it starts and reports done exactly once. The group
//! completes when the count drains to zero or when its deadline passes,
//! whichever happens first, and the completion callback fires exactly once.
//!
//! # Example
//!
//! ```rust,no_run
//! use convoy::{run_with_timeout, Timeout};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let outcome = run_with_timeout(
//!     Timeout::After(Duration::from_secs(5)),
//!     |group| {
//!         for _ in 0..3 {
//!             let guard = group.enter();
//!             tokio::spawn(async move {
//!                 // ... work ...
//!                 drop(guard);
//!             });
//!         }
//!     },
//!     |outcome| tracing::info!(?outcome, "all units settled"),
//! )
//! .await;
//! # let _ = outcome;
//! # }
//! ```

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{CoordinationError, RaceError};
use crate::race::race;
use crate::registry::ExecutionContext;

/// Outcome delivered to completion callbacks
pub type GroupOutcome = Result<(), CoordinationError>;

/// Callback installed through [`CoordinationGroup::on_complete`]
type CompletionCallback = Box<dyn FnOnce(GroupOutcome) + Send>;

/// Deadline for a group's fan-in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Wait for the count to drain, however long it takes
    #[default]
    Unbounded,
    /// Give up once this much time has passed
    After(Duration),
}

impl From<Duration> for Timeout {
    fn from(limit: Duration) -> Self {
        Self::After(limit)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(limit: Option<Duration>) -> Self {
        limit.map_or(Self::Unbounded, Self::After)
    }
}

/// Lifecycle of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Units may be registered; nobody is waiting yet
    Open,
    /// A fan-in is in progress
    Running,
    /// Terminal; reached through the zero-count or the timeout path
    Completed,
}

/// Counter of outstanding work units with exactly-once completion
///
/// Clones share one group. Work units hold a clone (or a [`GroupGuard`]) and
/// call [`mark_done`](Self::mark_done) when finished.
#[derive(Clone)]
pub struct CoordinationGroup {
    /// State shared by the group's clones and guards
    inner: Arc<GroupInner>,
}

/// Shared state behind a [`CoordinationGroup`]
struct GroupInner {
    /// Outstanding units; fan-in waiters watch for zero
    pending: watch::Sender<usize>,
    /// A fan-in has started
    running: AtomicBool,
    /// Mirrors `outcome.is_some()` for lock-free reads
    completed: AtomicBool,
    /// Set exactly once by whichever completion path wins
    outcome: Mutex<Option<GroupOutcome>>,
    /// Callback fired by whichever path completes the group
    on_complete: Mutex<Option<CompletionCallback>>,
}

/// Lock ignoring poisoning; the guarded data stays consistent across panics
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CoordinationGroup {
    /// Empty group in the `Open` state
    #[must_use]
    pub fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(GroupInner {
                pending,
                running: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                outcome: Mutex::new(None),
                on_complete: Mutex::new(None),
            }),
        }
    }

    /// Count one more outstanding unit
    ///
    /// Must be called before the unit starts running.
    ///
    /// # Panics
    ///
    /// Panics if the group has already completed.
    pub fn register(&self) {
        assert!(
            !self.is_completed(),
            "register called on a completed coordination group"
        );
        self.inner.pending.send_modify(|pending| *pending += 1);
    }

    /// Report one unit as finished
    ///
    /// The decrement that drains the count completes the group with success
    /// and runs the completion callback on the calling thread. After a timeout
    /// this still decrements the count but never fires a second completion.
    ///
    /// # Panics
    ///
    /// Panics if there are more `mark_done` calls than `register` calls.
    pub fn mark_done(&self) {
        let mut underflow = false;
        let mut remaining = 0;
        self.inner.pending.send_modify(|pending| {
            if *pending == 0 {
                underflow = true;
            } else {
                *pending -= 1;
                remaining = *pending;
            }
        });
        assert!(!underflow, "mark_done called more times than register");

        if remaining == 0 {
            if self.is_completed() {
                trace!("late unit finished after group completion");
            } else {
                self.complete(Ok(()));
            }
        }
    }

    /// Register a unit and return a guard that marks it done on drop
    #[must_use]
    pub fn enter(&self) -> GroupGuard {
        self.register();
        GroupGuard {
            group: self.clone(),
        }
    }

    /// Outstanding units right now
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Whether either completion path has fired
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> GroupState {
        if self.is_completed() {
            GroupState::Completed
        } else if self.inner.running.load(Ordering::Acquire) {
            GroupState::Running
        } else {
            GroupState::Open
        }
    }

    /// The outcome, once the group has completed
    #[must_use]
    pub fn outcome(&self) -> Option<GroupOutcome> {
        *lock(&self.inner.outcome)
    }

    /// Install the completion callback
    ///
    /// The callback runs on whichever thread completes the group: the one
    /// making the draining `mark_done` call, or a waiter whose deadline
    /// passed. If the group already completed, it runs immediately with the
    /// recorded outcome. Installing a second callback replaces the first.
    pub fn on_complete<C>(&self, completion: C)
    where
        C: FnOnce(GroupOutcome) + Send + 'static,
    {
        let slot = lock(&self.inner.outcome);
        if let Some(outcome) = *slot {
            drop(slot);
            completion(outcome);
            return;
        }
        // Stored while still holding the outcome lock so `complete` cannot
        // slip in between the check and the store
        *lock(&self.inner.on_complete) = Some(Box::new(completion));
    }

    /// Collector for unit results that rejects anything arriving after a timeout
    #[must_use]
    pub fn collector<T>(&self) -> GroupCollector<T> {
        GroupCollector {
            group: self.clone(),
            results: Arc::new(Mutex::new(Some(Vec::new()))),
        }
    }

    /// Wait for the count to drain, racing it against `timeout`
    ///
    /// Every caller gets the same outcome: the first one to finish decides it
    /// and fires the completion callback; later callers read it back.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Timeout`] if the deadline passed first.
    pub async fn wait(&self, timeout: impl Into<Timeout>) -> GroupOutcome {
        if let Some(outcome) = self.outcome() {
            return outcome;
        }
        self.inner.running.store(true, Ordering::Release);

        let timeout = timeout.into();
        let mut pending = self.inner.pending.subscribe();
        let drained = async move {
            // The sender lives in `inner`, which we hold, so this cannot close
            let _ = pending.wait_for(|count| *count == 0).await;
        };

        let outcome = match timeout {
            Timeout::Unbounded => {
                drained.await;
                Ok(())
            }
            Timeout::After(limit) => match race(limit, |_| async {
                drained.await;
                Ok::<(), Infallible>(())
            })
            .await
            {
                Ok(()) => Ok(()),
                Err(RaceError::Timeout(_)) => Err(CoordinationError::Timeout {
                    timeout: limit,
                    pending: self.pending(),
                }),
                Err(RaceError::Operation(never)) => match never {},
            },
        };

        self.complete(outcome)
    }

    /// Run the fan-in on `context` and deliver the outcome to `completion`
    ///
    /// Returns immediately; `completion` runs on `context` once the fan-in
    /// finishes and the handle resolves to the same outcome.
    pub fn notify_on<C>(
        &self,
        context: &ExecutionContext,
        timeout: impl Into<Timeout>,
        completion: C,
    ) -> JoinHandle<GroupOutcome>
    where
        C: FnOnce(GroupOutcome) + Send + 'static,
    {
        let group = self.clone();
        let timeout = timeout.into();
        context.spawn(async move {
            let outcome = group.wait(timeout).await;
            completion(outcome);
            outcome
        })
    }

    /// Record `outcome` unless another path already completed the group
    fn complete(&self, outcome: GroupOutcome) -> GroupOutcome {
        let mut slot = lock(&self.inner.outcome);
        if let Some(existing) = *slot {
            return existing;
        }
        *slot = Some(outcome);
        self.inner.completed.store(true, Ordering::Release);
        drop(slot);

        match &outcome {
            Ok(()) => debug!("coordination group drained"),
            Err(err) => debug!(%err, "coordination group timed out"),
        }

        let callback = lock(&self.inner.on_complete).take();
        if let Some(callback) = callback {
            callback(outcome);
        }
        outcome
    }
}

impl Default for CoordinationGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CoordinationGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationGroup")
            .field("pending", &self.pending())
            .field("state", &self.state())
            .finish()
    }
}

/// Registration that marks its unit done when dropped
#[must_use = "dropping the guard immediately marks the unit done"]
pub struct GroupGuard {
    /// Group the unit is registered with
    group: CoordinationGroup,
}

impl GroupGuard {
    /// The group this guard is registered with
    #[must_use]
    pub fn group(&self) -> &CoordinationGroup {
        &self.group
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.group.mark_done();
    }
}

/// Shared result sink tied to a group
///
/// Units push before reporting done. Once the group has timed out, or the
/// results were taken, further pushes are discarded.
pub struct GroupCollector<T> {
    /// Group whose outcome decides whether pushes are accepted
    group: CoordinationGroup,
    /// Accepted results; `None` once taken
    results: Arc<Mutex<Option<Vec<T>>>>,
}

impl<T> Clone for GroupCollector<T> {
    fn clone(&self) -> Self {
        Self {
            group: self.group.clone(),
            results: Arc::clone(&self.results),
        }
    }
}

impl<T> GroupCollector<T> {
    /// Store a unit's result; returns `false` if it arrived too late
    pub fn push(&self, value: T) -> bool {
        let mut results = lock(&self.results);
        match results.as_mut() {
            Some(results) if !matches!(self.group.outcome(), Some(Err(_))) => {
                results.push(value);
                true
            }
            _ => {
                trace!("discarding late result");
                false
            }
        }
    }

    /// Take every accepted result; later pushes are discarded
    #[must_use]
    pub fn take(&self) -> Vec<T> {
        lock(&self.results).take().unwrap_or_default()
    }
}

/// Open a group, run `setup`, then wait for it with `timeout`
///
/// `setup` registers and launches units. An internal registration is held
/// while it runs, so units that finish during setup cannot complete the group
/// early. `completion` receives the outcome exactly once, before the same
/// outcome is returned.
///
/// # Errors
///
/// Returns [`CoordinationError::Timeout`] if the deadline passed first.
pub async fn run_with_timeout<S, C>(timeout: Timeout, setup: S, completion: C) -> GroupOutcome
where
    S: FnOnce(&CoordinationGroup),
    C: FnOnce(GroupOutcome) + Send + 'static,
{
    let group = CoordinationGroup::new();

    group.register();
    setup(&group);
    group.mark_done();

    let outcome = group.wait(timeout).await;
    completion(outcome);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback() -> (Arc<AtomicUsize>, impl FnOnce(GroupOutcome) + Send + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        (calls, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_empty_group_completes_immediately() {
        let (calls, callback) = counting_callback();
        let outcome = run_with_timeout(Timeout::Unbounded, |_| {}, callback).await;
        assert_eq!(outcome, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_finishing_during_setup_does_not_complete_early() {
        let group = CoordinationGroup::new();
        let (calls, callback) = counting_callback();
        group.on_complete(callback);

        // Internal registration held for the duration of setup
        group.register();
        group.register();
        group.register();
        group.mark_done();
        assert!(!group.is_completed());
        assert_eq!(group.state(), GroupState::Open);

        let worker = group.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            worker.mark_done();
        });

        group.mark_done();
        assert!(!group.is_completed());
        assert_eq!(group.wait(Timeout::Unbounded).await, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.state(), GroupState::Completed);
        assert_eq!(group.pending(), 0);
    }

    #[test]
    fn test_draining_completes_without_waiter() {
        let group = CoordinationGroup::new();
        let (calls, callback) = counting_callback();
        group.on_complete(callback);

        group.register();
        group.register();
        group.mark_done();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(group.state(), GroupState::Open);

        group.mark_done();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.state(), GroupState::Completed);
        assert_eq!(group.outcome(), Some(Ok(())));
    }

    #[test]
    #[should_panic(expected = "register called on a completed coordination group")]
    fn test_register_after_drain_panics() {
        let group = CoordinationGroup::new();
        let guard = group.enter();
        drop(guard);
        assert!(group.is_completed());
        group.register();
    }

    #[tokio::test]
    async fn test_wait_after_drain_reads_outcome_once() {
        let group = CoordinationGroup::new();
        let (calls, callback) = counting_callback();
        group.on_complete(callback);

        drop(group.enter());
        assert_eq!(group.wait(Duration::from_millis(10)).await, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_wait_reads_recorded_outcome() {
        let group = CoordinationGroup::new();
        let _guard = group.enter();

        let first = group.wait(Duration::from_millis(10)).await;
        assert!(first.unwrap_err().is_timeout());

        let second = group.wait(Timeout::Unbounded).await;
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_on_complete_after_completion_runs_immediately() {
        let group = CoordinationGroup::new();
        assert_eq!(group.wait(Timeout::Unbounded).await, Ok(()));

        let (calls, callback) = counting_callback();
        group.on_complete(callback);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "mark_done called more times than register")]
    fn test_unbalanced_mark_done_panics() {
        let group = CoordinationGroup::new();
        group.register();
        group.mark_done();
        group.mark_done();
    }

    #[tokio::test]
    #[should_panic(expected = "register called on a completed coordination group")]
    async fn test_register_after_completion_panics() {
        let group = CoordinationGroup::new();
        let _ = group.wait(Timeout::Unbounded).await;
        group.register();
    }

    #[tokio::test(start_paused = true)]
    async fn test_collector_discards_results_after_timeout() {
        let group = CoordinationGroup::new();
        let results = group.collector::<u32>();

        let fast = results.clone();
        let fast_guard = group.enter();
        tokio::spawn(async move {
            fast.push(1);
            drop(fast_guard);
        });

        let slow = results.clone();
        let slow_guard = group.enter();
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let accepted = slow.push(2);
            drop(slow_guard);
            accepted
        });

        let outcome = group.wait(Duration::from_millis(100)).await;
        assert_eq!(
            outcome,
            Err(CoordinationError::Timeout {
                timeout: Duration::from_millis(100),
                pending: 1
            })
        );

        assert!(!late.await.unwrap());
        assert_eq!(results.take(), vec![1]);
        assert_eq!(group.pending(), 0);
    }

    #[test]
    fn test_timeout_conversions() {
        assert_eq!(Timeout::from(None), Timeout::Unbounded);
        assert_eq!(
            Timeout::from(Some(Duration::from_secs(1))),
            Timeout::After(Duration::from_secs(1))
        );
        assert_eq!(Timeout::default(), Timeout::Unbounded);
    }
}
