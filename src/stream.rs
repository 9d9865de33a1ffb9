//! Bounded-concurrency processing of a sequence of items
//!
//! [`BoundedStreamProcessor::process`] walks the items in chunks of `limit`.
//! Each chunk fans out onto the runtime and fans back in before the next one
//! starts, so at most `limit` operations are ever in flight. The first failure
//! aborts the rest of its chunk and is returned unchanged; later chunks never
//! start.
//!
//! Results are pushed in completion order, so they only match input order if
//! the operations happen to finish in order.

use std::future::Future;
use std::panic;

use convoy_sync::{CooperativeSemaphore, SemaphorePermit};
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, trace};

use crate::registry::ExecutionContext;

/// Applies an async operation to many items with a hard concurrency cap
#[derive(Debug, Clone)]
pub struct BoundedStreamProcessor {
    /// Maximum operations in flight
    limit: usize,
    /// Runtime to spawn on; the caller's when `None`
    handle: Option<Handle>,
}

impl BoundedStreamProcessor {
    /// Processor allowing at most `limit` operations in flight
    ///
    /// Operations are spawned on the caller's runtime unless
    /// [`on`](Self::on) picks a context.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is zero.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "concurrency limit must be positive");
        Self {
            limit,
            handle: None,
        }
    }

    /// Spawn operations on `context` instead of the caller's runtime
    #[must_use]
    pub fn on(mut self, context: &ExecutionContext) -> Self {
        self.handle = Some(context.handle().clone());
        self
    }

    /// Maximum operations in flight
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Spawn `future` on the configured runtime
    fn spawn_into<Fut>(&self, set: &mut JoinSet<Fut::Output>, future: Fut)
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        match &self.handle {
            Some(handle) => {
                set.spawn_on(future, handle);
            }
            None => {
                set.spawn(future);
            }
        }
    }

    /// Run `operation` over `items`, one chunk of `limit` at a time
    ///
    /// # Errors
    ///
    /// Returns the first failure reported by `operation`. In-flight siblings in
    /// the same chunk are aborted and no further chunks start.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from any operation.
    pub async fn process<I, F, Fut, R, E>(&self, items: I, operation: F) -> Result<Vec<R>, E>
    where
        I: IntoIterator,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        let mut items = items.into_iter();
        let mut results = Vec::new();
        let mut chunk_index = 0usize;

        loop {
            let mut in_flight = JoinSet::new();
            for item in items.by_ref().take(self.limit) {
                self.spawn_into(&mut in_flight, operation(item));
            }
            if in_flight.is_empty() {
                break;
            }
            trace!(chunk = chunk_index, size = in_flight.len(), "chunk fanned out");

            while let Some(joined) = in_flight.join_next().await {
                if let Err(err) = settle(joined, &mut results) {
                    debug!(chunk = chunk_index, aborted = in_flight.len(), "operation failed, aborting chunk");
                    in_flight.abort_all();
                    return Err(err);
                }
            }
            chunk_index += 1;
        }

        debug!(chunks = chunk_index, results = results.len(), "stream processed");
        Ok(results)
    }

    /// Like [`process`](Self::process) but with a sliding window
    ///
    /// A new item starts as soon as any in-flight one finishes, still never
    /// exceeding `limit`. The first failure aborts everything in flight and
    /// stops further items from starting.
    ///
    /// # Errors
    ///
    /// Returns the first failure reported by `operation`.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from any operation.
    pub async fn process_windowed<I, F, Fut, R, E>(
        &self,
        items: I,
        operation: F,
    ) -> Result<Vec<R>, E>
    where
        I: IntoIterator,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        let window = CooperativeSemaphore::new(self.limit);
        let mut in_flight = JoinSet::new();
        let mut results = Vec::new();

        for item in items {
            // Keep reaping while waiting for a slot so a failure stops the loop
            // before the next item starts
            let permit = loop {
                tokio::select! {
                    biased;
                    Some(joined) = in_flight.join_next() => {
                        if let Err(err) = settle(joined.map(release), &mut results) {
                            in_flight.abort_all();
                            return Err(err);
                        }
                    }
                    permit = window.acquire() => break permit,
                }
            };

            // The permit rides back with the output so a slot only frees up
            // once its result has been reaped
            let work = operation(item);
            self.spawn_into(&mut in_flight, async move { (work.await, permit) });
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = settle(joined.map(release), &mut results) {
                in_flight.abort_all();
                return Err(err);
            }
        }
        Ok(results)
    }
}

/// Drop the window permit that travelled back with `output`
fn release<T>((output, _permit): (T, SemaphorePermit)) -> T {
    output
}

/// Fold one finished operation into `results`
fn settle<R, E>(joined: Result<Result<R, E>, JoinError>, results: &mut Vec<R>) -> Result<(), E> {
    match joined {
        Ok(Ok(value)) => {
            results.push(value);
            Ok(())
        }
        Ok(Err(err)) => Err(err),
        Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
        // Aborted siblings; only happens while unwinding a failed chunk
        Err(_) => Ok(()),
    }
}

/// Shorthand for `BoundedStreamProcessor::new(limit).process(items, operation)`
///
/// # Errors
///
/// Returns the first failure reported by `operation`.
///
/// # Panics
///
/// Panics if `limit` is zero.
pub async fn process<I, F, Fut, R, E>(items: I, limit: usize, operation: F) -> Result<Vec<R>, E>
where
    I: IntoIterator,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    BoundedStreamProcessor::new(limit)
        .process(items, operation)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_empty_input() {
        let results: Vec<u32> = process(Vec::<u32>::new(), 3, |n| async move { Ok::<_, ()>(n) })
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    #[should_panic(expected = "concurrency limit must be positive")]
    fn test_zero_limit_panics() {
        let _ = BoundedStreamProcessor::new(0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_chunks_run_in_sequence() {
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let results = process(0..6u32, 3, {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            move |n| {
                let started = Arc::clone(&started);
                let finished = Arc::clone(&finished);
                async move {
                    // Nothing from the second chunk starts before the first drains
                    let before = started.fetch_add(1, Ordering::SeqCst);
                    if before >= 3 {
                        assert!(finished.load(Ordering::SeqCst) >= 3);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(results.len(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_windowed_respects_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let processor = BoundedStreamProcessor::new(4);
        let mut results = processor
            .process_windowed(1..=30u32, |n| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(u64::from(n % 5))).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(n)
                }
            })
            .await
            .unwrap();

        results.sort_unstable();
        assert_eq!(results, (1..=30).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_windowed_stops_after_failure() {
        let started = Arc::new(AtomicUsize::new(0));
        let processor = BoundedStreamProcessor::new(1);

        let outcome = processor
            .process_windowed(1..=10u32, |n| {
                let started = Arc::clone(&started);
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    if n == 3 {
                        Err(format!("item {n} failed"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(outcome, Err("item 3 failed".to_string()));
        assert_eq!(started.load(Ordering::SeqCst), 3);
    }
}
