//! Command-line interface definitions

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::DispatcherConfig;

/// Exercise convoy's dispatcher, coordination groups and bounded processing
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Worker threads per priority context (0 = size from CPU count)
    #[arg(long, default_value = "0")]
    pub workers: usize,

    /// Prefix for dispatcher thread names
    #[arg(long, default_value = "convoy")]
    pub thread_prefix: String,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (suppress all output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Demo to run
    #[command(subcommand)]
    pub command: Command,
}

/// Demo subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a batch of simulated operations with bounded concurrency
    Process {
        /// Number of items to process
        #[arg(long, default_value = "20")]
        items: u32,

        /// Maximum operations in flight
        #[arg(long, default_value = "5")]
        limit: usize,

        /// Simulated work per item in milliseconds
        #[arg(long, default_value = "10")]
        delay_ms: u64,

        /// Make the operation on this item fail
        #[arg(long)]
        fail_on: Option<u32>,

        /// Use a sliding window instead of fixed chunks
        #[arg(long)]
        windowed: bool,
    },

    /// Fan out units with staggered finish times and wait for them
    Group {
        /// Number of work units
        #[arg(long, default_value = "3")]
        units: u32,

        /// Finish time step between consecutive units in milliseconds
        #[arg(long, default_value = "50")]
        step_ms: u64,

        /// Give up after this many milliseconds (omit to wait forever)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Fire a repeating timer a fixed number of times
    Tick {
        /// Interval between ticks in milliseconds
        #[arg(long, default_value = "100")]
        interval_ms: u64,

        /// Number of ticks before the callback stops the timer
        #[arg(long, default_value = "5")]
        count: u32,
    },
}

impl Args {
    /// Validate argument combinations
    ///
    /// # Errors
    ///
    /// Returns an error for zero limits, empty intervals or conflicting flags.
    pub fn validate(&self) -> Result<()> {
        if self.quiet && self.verbose > 0 {
            anyhow::bail!("Cannot use both --quiet and --verbose options");
        }

        match &self.command {
            Command::Process { limit, .. } if *limit == 0 => {
                anyhow::bail!("--limit must be at least 1");
            }
            Command::Tick { interval_ms, .. } if *interval_ms == 0 => {
                anyhow::bail!("--interval-ms must be at least 1");
            }
            _ => {}
        }

        self.dispatcher_config().validate()?;
        Ok(())
    }

    /// Dispatcher configuration derived from the flags
    #[must_use]
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let config = if self.workers == 0 {
            DispatcherConfig::default()
        } else {
            DispatcherConfig::uniform(self.workers)
        };
        config.with_thread_name_prefix(self.thread_prefix.clone())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_parse_process_defaults() {
        let args = Args::try_parse_from(["convoy", "process"]).unwrap();
        match args.command {
            Command::Process { items, limit, windowed, fail_on, .. } => {
                assert_eq!(items, 20);
                assert_eq!(limit, 5);
                assert!(!windowed);
                assert!(fail_on.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_zero_limit_rejected() {
        let args = Args::try_parse_from(["convoy", "process", "--limit", "0"]).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_quiet_and_verbose_conflict() {
        let args = Args::try_parse_from(["convoy", "-q", "-v", "tick"]).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_workers_flag_builds_uniform_config() {
        let args =
            Args::try_parse_from(["convoy", "--workers", "3", "--thread-prefix", "demo", "group"])
                .unwrap();
        let config = args.dispatcher_config();
        assert_eq!(config.background_threads, 3);
        assert_eq!(config.user_initiated_threads, 3);
        assert_eq!(config.thread_name_prefix, "demo");
    }
}
