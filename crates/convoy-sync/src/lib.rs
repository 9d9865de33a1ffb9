//! Counting semaphores for both scheduling regimes
//!
//! This crate provides the two gating primitives used by `convoy`:
//!
//! # Primitives
//!
//! - [`CooperativeSemaphore`] - Suspension-based semaphore with strict FIFO hand-off.
//!   Executor-agnostic: it only relies on [`std::task::Waker`].
//! - [`BlockingSemaphore`] - Thread-blocking semaphore built on a mutex and condvar.
//!   [`Gate`] is the same type constructed with zero permits.
//!
//! The two must not be mixed within one wait: never await a
//! [`CooperativeSemaphore`] while holding a [`BlockingSemaphore`] permit that a
//! suspended task needs.
//!
//! # Example
//!
//! ```rust,no_run
//! use convoy_sync::CooperativeSemaphore;
//!
//! #[compio::main]
//! async fn main() {
//!     let sem = CooperativeSemaphore::new(100);
//!
//!     // Spawn many tasks, but only 100 run concurrently
//!     for i in 0..1000 {
//!         let sem = sem.clone();
//!         compio::runtime::spawn(async move {
//!             let _permit = sem.acquire().await;
//!             println!("Task {}", i);
//!         });
//!     }
//! }
//! ```

mod blocking;
mod semaphore;

pub use blocking::{BlockingPermit, BlockingSemaphore, Gate};
pub use semaphore::{CooperativeSemaphore, SemaphorePermit};
