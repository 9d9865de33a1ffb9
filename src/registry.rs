//! Execution contexts and the named-queue registry
//!
//! An [`ExecutionContext`] is a tokio runtime plus an identity. Every thread the
//! runtime starts records that identity in a thread-local, which is how the
//! dispatcher answers "am I already running on this context?" without asking
//! the runtime.
//!
//! Serial contexts have exactly one worker thread and run work on it, so at
//! most one unit executes at a time. Concurrent contexts run blocking work on
//! the runtime's blocking pool.

use std::cell::Cell;
use std::collections::HashMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::Result;

/// Whether a context runs one unit at a time or many
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// One worker; units run one at a time in submission order
    Serial,
    /// Many workers; units may run in parallel
    Concurrent,
}

/// Whether the caller waits for submitted work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Block the caller until the work returns
    Synchronous,
    /// Return right after submission
    Asynchronous,
}

/// Process-unique identity of an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

/// Source of [`ContextId`]s
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Context owning the current thread, set by the runtime's thread-start hook
    static CURRENT_CONTEXT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Identity of the context owning the calling thread, if any
#[must_use]
pub fn current_context() -> Option<ContextId> {
    CURRENT_CONTEXT.with(Cell::get)
}

/// A queue work can be submitted to
///
/// Cheap to clone; all clones refer to the same runtime. The runtime is shut
/// down in the background when the last clone goes away, so dropping a context
/// from inside async code is fine.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Runtime and identity shared by all clones
    inner: Arc<ContextInner>,
}

/// Runtime plus identity behind an [`ExecutionContext`]
struct ContextInner {
    /// Identity recorded in each worker's thread-local
    id: ContextId,
    /// Thread name and log label
    label: String,
    /// Serial or concurrent
    kind: QueueKind,
    /// Handle used for every submission
    handle: Handle,
    /// Owned runtime; taken and shut down in the background on drop
    runtime: Option<Runtime>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!(label = %self.label, "shutting down execution context");
            runtime.shutdown_background();
        }
    }
}

/// Non-owning reference to a context, held by timers armed on it
#[derive(Clone)]
pub(crate) struct WeakContext(Weak<ContextInner>);

impl WeakContext {
    /// Strong handle, if the context is still alive
    pub(crate) fn upgrade(&self) -> Option<ExecutionContext> {
        self.0.upgrade().map(|inner| ExecutionContext { inner })
    }
}

impl ExecutionContext {
    /// Build a new context backed by its own runtime
    ///
    /// Serial contexts ignore `workers` and always get one worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot spawn its threads.
    pub fn new(
        label: impl Into<String>,
        kind: QueueKind,
        workers: usize,
        max_blocking_threads: usize,
    ) -> Result<Self> {
        let label = label.into();
        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        let workers = match kind {
            QueueKind::Serial => 1,
            QueueKind::Concurrent => workers.max(1),
        };

        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .max_blocking_threads(max_blocking_threads.max(1))
            .thread_name(label.clone())
            .on_thread_start(move || CURRENT_CONTEXT.with(|current| current.set(Some(id))))
            .enable_time()
            .build()?;

        debug!(%label, ?kind, workers, "created execution context");

        Ok(Self {
            inner: Arc::new(ContextInner {
                id,
                label,
                kind,
                handle: runtime.handle().clone(),
                runtime: Some(runtime),
            }),
        })
    }

    /// Process-unique identity
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Label used for thread names and logs
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether units run one at a time
    #[must_use]
    pub fn kind(&self) -> QueueKind {
        self.inner.kind
    }

    /// Runtime handle, for callers that need tokio APIs directly
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Whether the calling thread belongs to this context
    #[must_use]
    pub fn is_current(&self) -> bool {
        current_context() == Some(self.inner.id)
    }

    /// Non-owning handle for timers
    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext(Arc::downgrade(&self.inner))
    }

    /// Run `work` with the given mode, discarding its value
    pub fn run<F>(&self, mode: ExecutionMode, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match mode {
            ExecutionMode::Synchronous => self.run_sync(work),
            ExecutionMode::Asynchronous => {
                drop(self.submit(work));
            }
        }
    }

    /// Run `work` on this context and block until it returns
    ///
    /// Already on this context: `work` runs inline, since resubmitting to a
    /// serial context from its own worker would never be scheduled. A panic in
    /// `work` is re-raised on the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if `work` panics, or if the context shuts down before running it.
    pub fn run_sync<F, R>(&self, work: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            trace!(label = %self.inner.label, "running synchronous work inline");
            return work();
        }

        let (tx, rx) = futures::channel::oneshot::channel();
        drop(self.submit(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(work));
            let _ = tx.send(outcome);
        }));

        match futures::executor::block_on(rx) {
            Ok(Ok(value)) => value,
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => panic!(
                "execution context `{}` shut down before running synchronous work",
                self.inner.label
            ),
        }
    }

    /// Submit `work` and return immediately
    ///
    /// The handle may be awaited for the value or dropped to detach.
    pub fn submit<F, R>(&self, work: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        match self.inner.kind {
            QueueKind::Serial => self.inner.handle.spawn(async move { work() }),
            QueueKind::Concurrent => self.inner.handle.spawn_blocking(work),
        }
    }

    /// Spawn an async unit on this context's runtime
    pub fn spawn<Fut>(&self, future: Fut) -> JoinHandle<Fut::Output>
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Drive `future` on this context and block the calling thread for its output
    ///
    /// Bridges synchronous callers onto the suspension-based primitives. Must
    /// not be called from an async task of a different runtime.
    ///
    /// # Panics
    ///
    /// Panics if the future panics or the context shuts down first.
    pub fn block_on<Fut>(&self, future: Fut) -> Fut::Output
    where
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        if self.is_current() {
            let handle = self.inner.handle.clone();
            return tokio::task::block_in_place(move || handle.block_on(future));
        }

        match futures::executor::block_on(self.spawn(future)) {
            Ok(value) => value,
            Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
            Err(_) => panic!(
                "execution context `{}` shut down before the future completed",
                self.inner.label
            ),
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

/// Lazily created named queues, cached for the registry's lifetime
///
/// Owned by a [`Dispatcher`](crate::Dispatcher); there is no process-wide
/// instance. Entries are never evicted.
pub struct QueueRegistry {
    /// Queues by label, never evicted
    queues: Mutex<HashMap<String, ExecutionContext>>,
    /// Worker threads for new concurrent queues
    concurrent_workers: usize,
    /// Blocking-pool cap for new queues
    max_blocking_threads: usize,
}

impl QueueRegistry {
    /// Empty registry sizing new queues with the given thread counts
    #[must_use]
    pub fn new(concurrent_workers: usize, max_blocking_threads: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            concurrent_workers,
            max_blocking_threads,
        }
    }

    /// Fetch the queue registered under `label`, creating it on first use
    ///
    /// The kind only applies at creation; later lookups return the cached
    /// queue whatever kind they ask for.
    ///
    /// # Errors
    ///
    /// Returns an error if a new queue's runtime cannot be built.
    pub fn queue_for(&self, label: &str, kind: QueueKind) -> Result<ExecutionContext> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = queues.get(label) {
            if existing.kind() != kind {
                debug!(label, existing = ?existing.kind(), requested = ?kind, "queue kind mismatch, reusing cached queue");
            }
            return Ok(existing.clone());
        }

        let context = ExecutionContext::new(
            label,
            kind,
            self.concurrent_workers,
            self.max_blocking_threads,
        )?;
        queues.insert(label.to_string(), context.clone());
        Ok(context)
    }

    /// Number of named queues created so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no named queue has been created yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
