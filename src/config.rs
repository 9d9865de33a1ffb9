//! Dispatcher configuration
//!
//! Worker counts for the four per-priority execution contexts plus the thread
//! name prefix. Defaults scale with the machine's CPU count.

use crate::error::{Error, Result};
use crate::priority::ExecutionPriority;

/// Sizing for the execution contexts a [`Dispatcher`](crate::Dispatcher) owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Worker threads backing [`ExecutionPriority::Background`]
    pub background_threads: usize,
    /// Worker threads backing [`ExecutionPriority::Medium`]
    pub medium_threads: usize,
    /// Worker threads backing [`ExecutionPriority::High`]
    pub high_threads: usize,
    /// Worker threads backing [`ExecutionPriority::UserInitiated`]
    pub user_initiated_threads: usize,
    /// Upper bound on blocking-pool threads per context
    pub max_blocking_threads: usize,
    /// Prefix for every thread name the dispatcher creates
    pub thread_name_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            background_threads: (cpus / 4).max(1),
            medium_threads: cpus,
            high_threads: (cpus / 2).max(1),
            user_initiated_threads: (cpus / 2).max(1),
            max_blocking_threads: 64,
            thread_name_prefix: "convoy".to_string(),
        }
    }
}

impl DispatcherConfig {
    /// Same worker count for every priority
    #[must_use]
    pub fn uniform(workers: usize) -> Self {
        Self {
            background_threads: workers,
            medium_threads: workers,
            high_threads: workers,
            user_initiated_threads: workers,
            ..Self::default()
        }
    }

    /// Prefix thread names with `prefix`
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Cap blocking-pool threads per context
    #[must_use]
    pub const fn with_max_blocking_threads(mut self, threads: usize) -> Self {
        self.max_blocking_threads = threads;
        self
    }

    /// Worker threads configured for `priority`
    #[must_use]
    pub const fn workers_for(&self, priority: ExecutionPriority) -> usize {
        match priority {
            ExecutionPriority::Background => self.background_threads,
            ExecutionPriority::Medium => self.medium_threads,
            ExecutionPriority::High => self.high_threads,
            ExecutionPriority::UserInitiated => self.user_initiated_threads,
        }
    }

    /// Check the configuration before any thread is spawned
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any context has zero workers, the
    /// blocking pool is empty, or the thread name prefix is blank.
    pub fn validate(&self) -> Result<()> {
        for priority in ExecutionPriority::ALL {
            if self.workers_for(priority) == 0 {
                return Err(Error::InvalidConfig(format!(
                    "{priority} context needs at least one worker thread"
                )));
            }
        }

        if self.max_blocking_threads == 0 {
            return Err(Error::InvalidConfig(
                "max_blocking_threads must be at least 1".to_string(),
            ));
        }

        if self.thread_name_prefix.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "thread name prefix must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
