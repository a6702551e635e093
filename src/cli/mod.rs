//! Command-line interface for eval-queue.
//!
//! Provides operator commands for queue statistics, job inspection,
//! cancellation, dead-letter management and stale-job recovery.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
