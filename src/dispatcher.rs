//! Priority-aware work dispatch
//!
//! A [`Dispatcher`] owns one [`ExecutionContext`] per [`ExecutionPriority`] and
//! a [`QueueRegistry`] of named queues. Work is submitted by value with a
//! [`PriorityClass`]; there is one parameterized entry point rather than a
//! family of per-priority helpers.
//!
//! # Example
//!
//! ```rust,no_run
//! use convoy::{Dispatcher, DispatcherConfig, ExecutionMode, PriorityClass};
//!
//! # fn example() -> convoy::Result<()> {
//! let dispatcher = Dispatcher::new(DispatcherConfig::default())?;
//!
//! let answer = dispatcher.run_sync(PriorityClass::Interactive, || 6 * 7);
//! assert_eq!(answer, 42);
//!
//! dispatcher.run(ExecutionMode::Asynchronous, PriorityClass::Background, || {
//!     tracing::info!("running in the background");
//! });
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::DispatcherConfig;
use crate::error::{CoordinationError, Result};
use crate::group::{run_with_timeout, CoordinationGroup, Timeout};
use crate::priority::{ExecutionPriority, PriorityClass};
use crate::registry::{ExecutionContext, ExecutionMode, QueueKind, QueueRegistry};

/// What a repeating timer callback wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Arm the next tick
    Continue,
    /// Stop the timer after this tick
    Stop,
}

/// Cancellation handle for a delayed or repeating timer
///
/// Dropping the handle does not cancel the timer.
#[derive(Debug)]
pub struct TimerHandle {
    /// Task driving the timer; aborting it cancels the timer
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Stop the timer
    ///
    /// A callback that already started keeps running; no further callbacks fire.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Whether the timer has fired for the last time or was cancelled
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Runs work at a priority on the matching execution context
///
/// Cheap to clone; clones share contexts and the queue registry.
#[derive(Clone)]
pub struct Dispatcher {
    /// Contexts, registry and config shared by all clones
    inner: Arc<DispatcherInner>,
}

/// State shared by every clone of a [`Dispatcher`]
struct DispatcherInner {
    /// Indexed by `ExecutionPriority as usize`
    contexts: Vec<ExecutionContext>,
    /// Named queues created through [`Dispatcher::queue`]
    registry: QueueRegistry,
    /// Configuration the contexts were built from
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Build every per-priority context up front
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a runtime cannot
    /// be started.
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        config.validate()?;

        let contexts = ExecutionPriority::ALL
            .into_iter()
            .map(|priority| {
                ExecutionContext::new(
                    format!("{}-{priority}", config.thread_name_prefix),
                    QueueKind::Concurrent,
                    config.workers_for(priority),
                    config.max_blocking_threads,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            background = config.background_threads,
            medium = config.medium_threads,
            high = config.high_threads,
            user_initiated = config.user_initiated_threads,
            "dispatcher started"
        );

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                contexts,
                registry: QueueRegistry::new(config.medium_threads, config.max_blocking_threads),
                config,
            }),
        })
    }

    /// Configuration this dispatcher was built with
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Context that work at `priority` runs on
    #[must_use]
    pub fn context(&self, priority: PriorityClass) -> &ExecutionContext {
        &self.inner.contexts[priority.execution_priority() as usize]
    }

    /// Named queue from the dispatcher's registry, created on first use
    ///
    /// # Errors
    ///
    /// Returns an error if a new queue's runtime cannot be built.
    pub fn queue(&self, label: &str, kind: QueueKind) -> Result<ExecutionContext> {
        let label = format!("{}-{label}", self.inner.config.thread_name_prefix);
        self.inner.registry.queue_for(&label, kind)
    }

    /// Registry backing [`Dispatcher::queue`]
    #[must_use]
    pub fn registry(&self) -> &QueueRegistry {
        &self.inner.registry
    }

    /// Run `work` at `priority`
    ///
    /// `Synchronous` blocks until `work` returns, running it inline when the
    /// caller is already on the target context. `Asynchronous` returns right
    /// after submission.
    pub fn run<F>(&self, mode: ExecutionMode, priority: PriorityClass, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.context(priority).run(mode, work);
    }

    /// Run `work` at `priority` and return its value
    ///
    /// # Panics
    ///
    /// Re-raises a panic from `work` on the calling thread.
    pub fn run_sync<F, R>(&self, priority: PriorityClass, work: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.context(priority).run_sync(work)
    }

    /// Submit `work` at `priority` without waiting
    pub fn run_async<F, R>(&self, priority: PriorityClass, work: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.context(priority).submit(work)
    }

    /// Spawn an async unit at `priority`
    pub fn spawn<Fut>(&self, priority: PriorityClass, future: Fut) -> JoinHandle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.context(priority).spawn(future)
    }

    /// Drive `future` at `priority`, blocking the calling thread for the output
    ///
    /// # Panics
    ///
    /// Re-raises a panic from the future on the calling thread.
    pub fn block_on<Fut>(&self, priority: PriorityClass, future: Fut) -> Fut::Output
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.context(priority).block_on(future)
    }

    /// Run `work` once after `delay`
    ///
    /// The timer lives on the priority's context and fires `work` through the
    /// asynchronous path. Dropping the dispatcher before the delay elapses
    /// cancels the timer.
    pub fn run_after<F>(&self, priority: PriorityClass, delay: Duration, work: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let context = self.context(priority);
        let target = context.downgrade();
        trace!(?delay, ?priority, "arming one-shot timer");

        let task = context.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(context) = target.upgrade() {
                context.run(ExecutionMode::Asynchronous, work);
            }
        });
        TimerHandle { task }
    }

    /// Invoke `work` every `interval` until it returns [`Tick::Stop`]
    ///
    /// Ticks never overlap: the next tick is scheduled after the previous
    /// callback returned. A panicking callback stops the timer.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn run_repeating<F>(&self, priority: PriorityClass, interval: Duration, work: F) -> TimerHandle
    where
        F: FnMut() -> Tick + Send + 'static,
    {
        assert!(!interval.is_zero(), "repeating interval must be non-zero");

        let context = self.context(priority);
        let target = context.downgrade();
        debug!(?interval, ?priority, "arming repeating timer");

        let task = context.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut work = Some(work);
            let mut ticks = 0u64;

            while let Some(mut callback) = work.take() {
                ticker.tick().await;
                let Some(context) = target.upgrade() else {
                    break;
                };

                // The callback travels to the context and back, so no lock is
                // needed around the `FnMut`
                let fired = context.submit(move || {
                    let tick = callback();
                    (callback, tick)
                });
                drop(context);

                match fired.await {
                    Ok((callback, Tick::Continue)) => {
                        ticks += 1;
                        work = Some(callback);
                    }
                    Ok((_, Tick::Stop)) => {
                        debug!(ticks = ticks + 1, "repeating timer stopped by callback");
                    }
                    Err(err) => {
                        if err.is_panic() {
                            warn!(ticks, "repeating timer callback panicked, timer stopped");
                        }
                    }
                }
            }
        });
        TimerHandle { task }
    }

    /// Blocking adapter over [`run_with_timeout`]
    ///
    /// Runs the group's fan-in on the priority's context, blocks the caller
    /// until `completion` has run, and returns the same outcome.
    pub fn run_group_with_timeout<S, C>(
        &self,
        priority: PriorityClass,
        timeout: Timeout,
        setup: S,
        completion: C,
    ) -> std::result::Result<(), CoordinationError>
    where
        S: FnOnce(&CoordinationGroup) + Send + 'static,
        C: FnOnce(std::result::Result<(), CoordinationError>) + Send + 'static,
    {
        self.block_on(priority, run_with_timeout(timeout, setup, completion))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("contexts", &self.inner.contexts)
            .field("queues", &self.inner.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(DispatcherConfig::uniform(2).with_thread_name_prefix("test")).unwrap()
    }

    #[test]
    fn test_classes_sharing_a_priority_share_a_context() {
        let dispatcher = dispatcher();
        assert_eq!(
            dispatcher.context(PriorityClass::Inherit).id(),
            dispatcher.context(PriorityClass::Default).id()
        );
        assert_eq!(
            dispatcher.context(PriorityClass::Background).id(),
            dispatcher.context(PriorityClass::LowBackground).id()
        );
        assert_ne!(
            dispatcher.context(PriorityClass::HighBackground).id(),
            dispatcher.context(PriorityClass::Interactive).id()
        );
    }

    #[test]
    fn test_context_labels_follow_prefix() {
        let dispatcher = dispatcher();
        assert_eq!(dispatcher.context(PriorityClass::Interactive).label(), "test-user-initiated");
        let queue = dispatcher.queue("db", QueueKind::Serial).unwrap();
        assert_eq!(queue.label(), "test-db");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Dispatcher::new(DispatcherConfig::uniform(0)).unwrap_err();
        assert!(matches!(err, crate::Error::InvalidConfig(_)));
    }

    #[test]
    #[should_panic(expected = "repeating interval must be non-zero")]
    fn test_zero_interval_panics() {
        let dispatcher = dispatcher();
        let _ = dispatcher.run_repeating(PriorityClass::Default, Duration::ZERO, || Tick::Stop);
    }
}
