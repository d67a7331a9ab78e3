//! Tunables for clean and abort task pacing.

use serde::{Deserialize, Serialize};

/// Pacing knobs for rid retirement tasks.
///
/// The defaults match production pacing; tests shrink the intervals so a
/// whole clean runs in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanConfig {
    /// Ceiling on concurrently running clean tasks, and separately on
    /// abort tasks.
    pub max_tasks: usize,
    /// First backoff interval when a gate is not yet satisfied.
    pub backoff_initial_ms: u64,
    /// Upper bound the doubling backoff saturates at.
    pub backoff_cap_ms: u64,
    /// Interval between peer status polls.
    pub poll_interval_ms: u64,
    /// Interval between checks that an aborted clean task has stopped.
    pub abort_check_interval_ms: u64,
    /// How many such checks to make before giving up the wait.
    pub abort_check_attempts: u32,
    /// Longest a read-only replica waits for its RUV to cover the
    /// retirement point before purging anyway.
    pub max_wait_ms: u64,
}

impl Default for CleanConfig {
    fn default() -> Self {
        CleanConfig {
            max_tasks: 64,
            backoff_initial_ms: 10_000,
            backoff_cap_ms: 7_200_000,
            poll_interval_ms: 5_000,
            abort_check_interval_ms: 1_000,
            abort_check_attempts: 60,
            max_wait_ms: 7_200_000,
        }
    }
}

impl CleanConfig {
    /// A configuration with all waits collapsed, for in-process tests.
    pub fn fast() -> Self {
        CleanConfig {
            max_tasks: 64,
            backoff_initial_ms: 5,
            backoff_cap_ms: 40,
            poll_interval_ms: 5,
            abort_check_interval_ms: 5,
            abort_check_attempts: 200,
            max_wait_ms: 500,
        }
    }
}
