//! Integration tests for bounded-concurrency processing

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{small_dispatcher, test_timeout_guard};
use convoy::{process, BoundedStreamProcessor, PriorityClass};
use proptest::prelude::*;
use rstest::rstest;

/// Tracks how many operations are in flight and the highest count seen
#[derive(Clone, Default)]
struct Occupancy {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Occupancy {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[rstest]
#[case(1)]
#[case(5)]
#[case(7)]
#[case(32)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_identity_returns_every_item_within_limit(#[case] limit: usize) {
    let occupancy = Occupancy::default();

    let mut results = process(1..=20u32, limit, {
        let occupancy = occupancy.clone();
        move |n| {
            let occupancy = occupancy.clone();
            async move {
                occupancy.enter();
                tokio::time::sleep(Duration::from_millis(u64::from(n % 4))).await;
                occupancy.leave();
                Ok::<_, String>(n)
            }
        }
    })
    .await
    .unwrap();

    results.sort_unstable();
    assert_eq!(results, (1..=20).collect::<Vec<_>>());
    assert!(occupancy.peak() <= limit);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_is_returned_without_partial_results() {
    let outcome = process(vec![1u32, 2, 3], 2, |n| async move {
        if n == 2 {
            Err(format!("item {n} rejected"))
        } else {
            Ok(n)
        }
    })
    .await;

    assert_eq!(outcome, Err("item 2 rejected".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_failure_cancels_chunk_siblings_and_later_chunks() {
    let finished = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(AtomicUsize::new(0));

    let outcome = process(1..=9u32, 3, {
        let finished = Arc::clone(&finished);
        let started = Arc::clone(&started);
        move |n| {
            let finished = Arc::clone(&finished);
            let started = Arc::clone(&started);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                if n == 4 {
                    return Err("chunk two failed");
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(n)
            }
        }
    })
    .await;

    assert_eq!(outcome, Err("chunk two failed"));

    // Aborted siblings (5 and 6) never finish; chunk three never starts
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 3);
    assert!(started.load(Ordering::SeqCst) <= 6);
}

#[test]
fn test_processor_on_dispatcher_context() {
    let _guard = test_timeout_guard(Duration::from_secs(10));
    let dispatcher = small_dispatcher();
    let worker = dispatcher.context(PriorityClass::HighBackground).clone();
    let processor = BoundedStreamProcessor::new(3).on(&worker);

    let on_worker = dispatcher.block_on(PriorityClass::Interactive, async move {
        processor
            .process(0..6u32, move |_| {
                let worker = worker.clone();
                async move { Ok::<_, ()>(worker.is_current()) }
            })
            .await
    });

    let on_worker = on_worker.unwrap();
    assert_eq!(on_worker.len(), 6);
    assert!(on_worker.into_iter().all(|flag| flag));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_windowed_keeps_window_full() {
    let occupancy = Occupancy::default();
    let processor = BoundedStreamProcessor::new(3);

    let results = processor
        .process_windowed(0..12u32, {
            let occupancy = occupancy.clone();
            move |n| {
                let occupancy = occupancy.clone();
                async move {
                    occupancy.enter();
                    tokio::time::sleep(Duration::from_millis(if n == 0 { 40 } else { 2 })).await;
                    occupancy.leave();
                    Ok::<_, String>(n)
                }
            }
        })
        .await
        .unwrap();

    // The slow first item does not hold back the rest of the window
    assert_eq!(results.len(), 12);
    assert_eq!(results.last(), Some(&0));
    assert!(occupancy.peak() <= 3);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_process_preserves_multiset(items in prop::collection::vec(0u16..1000, 0..40), limit in 1usize..8) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let mut expected = items.clone();
        let mut results = runtime
            .block_on(process(items, limit, |n| async move { Ok::<_, ()>(n) }))
            .unwrap();

        expected.sort_unstable();
        results.sort_unstable();
        prop_assert_eq!(results, expected);
    }
}
