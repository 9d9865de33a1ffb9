//! convoy: concurrency coordination without hand-rolled threads
//!
//! This library lets callers launch background work at a priority, wait for a
//! set of independent units to finish (or time out), throttle parallelism, and
//! gate access to shared resources. Execution itself is delegated to tokio
//! runtimes; this crate only decides where work runs and how it is joined.
//!
//! Two scheduling regimes coexist:
//!
//! - thread-pool style: [`Dispatcher::run`], [`BlockingSemaphore`]
//! - suspension style: [`CoordinationGroup::wait`], [`CooperativeSemaphore`],
//!   [`BoundedStreamProcessor`]
//!
//! [`Dispatcher::spawn`] and [`Dispatcher::block_on`] bridge between them.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod group;
pub mod priority;
pub mod race;
pub mod registry;
pub mod stream;

// Re-export commonly used types
pub use config::DispatcherConfig;
pub use convoy_sync::{BlockingSemaphore, CooperativeSemaphore, Gate, SemaphorePermit};
pub use dispatcher::{Dispatcher, Tick, TimerHandle};
pub use error::{CoordinationError, Error, RaceError, Result};
pub use group::{
    run_with_timeout, CoordinationGroup, GroupCollector, GroupGuard, GroupOutcome, GroupState,
    Timeout,
};
pub use priority::{ExecutionPriority, PriorityClass};
pub use race::{race, race_on, CancelFlag};
pub use registry::{ExecutionContext, ExecutionMode, QueueKind, QueueRegistry};
pub use stream::{process, BoundedStreamProcessor};
