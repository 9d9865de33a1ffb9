#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use convoy::{Dispatcher, DispatcherConfig};

/// Aborts the whole test binary if dropped too late; a hung dispatcher test
/// would otherwise block forever instead of failing
pub struct TestTimeoutGuard {
    cancelled: Arc<AtomicBool>,
}

impl Drop for TestTimeoutGuard {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

pub fn test_timeout_guard(duration: Duration) -> TestTimeoutGuard {
    let cancelled = Arc::new(AtomicBool::new(false));
    let cancelled_clone = Arc::clone(&cancelled);
    std::thread::spawn(move || {
        std::thread::sleep(duration);
        if !cancelled_clone.load(Ordering::SeqCst) {
            eprintln!("Test timeout exceeded ({}s), likely deadlock. Aborting.", duration.as_secs());
            std::process::abort();
        }
    });
    TestTimeoutGuard { cancelled }
}

/// Small dispatcher: two workers per priority
pub fn small_dispatcher() -> Dispatcher {
    Dispatcher::new(DispatcherConfig::uniform(2).with_thread_name_prefix("it")).unwrap()
}

/// Dispatcher whose every priority context has a single worker
pub fn single_worker_dispatcher() -> Dispatcher {
    Dispatcher::new(
        DispatcherConfig::uniform(1)
            .with_max_blocking_threads(1)
            .with_thread_name_prefix("it1"),
    )
    .unwrap()
}
