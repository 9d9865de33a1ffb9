//! convoy: demo front end for the coordination primitives
//!
//! Each subcommand drives one primitive end to end on a real dispatcher.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use convoy::cli::{Args, Command};
use convoy::{
    BoundedStreamProcessor, Dispatcher, Gate, PriorityClass, Tick, Timeout,
};
use tracing::{info, warn, Level};

/// Parse arguments, set up logging and run the chosen demo
fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging based on verbosity and quiet mode
    let level = if args.quiet {
        Level::ERROR
    } else {
        match args.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_names(args.verbose > 1)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    args.validate().context("Invalid arguments")?;

    let dispatcher =
        Dispatcher::new(args.dispatcher_config()).context("Failed to start dispatcher")?;
    info!("Starting convoy v{}", env!("CARGO_PKG_VERSION"));

    match args.command.clone() {
        Command::Process {
            items,
            limit,
            delay_ms,
            fail_on,
            windowed,
        } => run_process(&dispatcher, items, limit, delay_ms, fail_on, windowed),
        Command::Group {
            units,
            step_ms,
            timeout_ms,
        } => run_group(&dispatcher, units, step_ms, timeout_ms),
        Command::Tick { interval_ms, count } => {
            run_tick(&dispatcher, interval_ms, count);
            Ok(())
        }
    }
}

/// Square `items` numbers with bounded concurrency
fn run_process(
    dispatcher: &Dispatcher,
    items: u32,
    limit: usize,
    delay_ms: u64,
    fail_on: Option<u32>,
    windowed: bool,
) -> Result<()> {
    let processor =
        BoundedStreamProcessor::new(limit).on(dispatcher.context(PriorityClass::Default));
    let started = Instant::now();

    let outcome = dispatcher.block_on(PriorityClass::Interactive, async move {
        let operation = move |n: u32| async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if fail_on == Some(n) {
                Err(format!("item {n} failed"))
            } else {
                Ok(n * n)
            }
        };
        if windowed {
            processor.process_windowed(1..=items, operation).await
        } else {
            processor.process(1..=items, operation).await
        }
    });

    match outcome {
        Ok(results) => {
            println!(
                "Processed {} item(s) in {:?} (limit {limit})",
                results.len(),
                started.elapsed()
            );
            Ok(())
        }
        Err(err) => anyhow::bail!("Processing aborted: {err}"),
    }
}

/// Fan out staggered units and wait for them with an optional deadline
fn run_group(
    dispatcher: &Dispatcher,
    units: u32,
    step_ms: u64,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let timeout = Timeout::from(timeout_ms.map(Duration::from_millis));
    let launcher = dispatcher.clone();
    let started = Instant::now();

    let outcome = dispatcher.run_group_with_timeout(
        PriorityClass::Interactive,
        timeout,
        move |group| {
            for unit in 1..=units {
                let guard = group.enter();
                let delay = Duration::from_millis(step_ms * u64::from(unit));
                // Detached: the guard reports the unit done when the timer fires
                let _timer = launcher.run_after(PriorityClass::Background, delay, move || {
                    info!(unit, "unit finished");
                    drop(guard);
                });
            }
        },
        |outcome| match outcome {
            Ok(()) => info!("group drained"),
            Err(err) => warn!(%err, "group gave up"),
        },
    );

    match outcome {
        Ok(()) => {
            println!("All {units} unit(s) finished in {:?}", started.elapsed());
            Ok(())
        }
        Err(err) => anyhow::bail!("{err}"),
    }
}

/// Print a line per tick until `count` ticks have fired
fn run_tick(dispatcher: &Dispatcher, interval_ms: u64, count: u32) {
    let fired = Arc::new(AtomicU32::new(0));
    let done = Gate::gate();

    let ticks = Arc::clone(&fired);
    let finished = done.clone();
    let _timer = dispatcher.run_repeating(
        PriorityClass::Default,
        Duration::from_millis(interval_ms),
        move || {
            let n = ticks.fetch_add(1, Ordering::SeqCst) + 1;
            println!("tick {n}");
            if n >= count {
                finished.signal();
                Tick::Stop
            } else {
                Tick::Continue
            }
        },
    );

    done.wait();
    info!(ticks = fired.load(Ordering::SeqCst), "timer stopped");
}
