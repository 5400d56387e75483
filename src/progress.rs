//! Run lifecycle notifications.
//!
//! The engine only calls these hooks; it never depends on what they do.
//! Implementations must not block.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::Error;
use crate::pipeline::types::RunStatistics;

/// Lifecycle hooks for one run. Every method defaults to a no-op.
pub trait RunObserver: Send + Sync {
    /// The executor is about to pull the first item from `source`.
    fn on_start(&self, _source: &str) {}

    /// Raw item `index` (zero-based) finished its pipeline pass.
    /// `total` is `None` when the source cannot tell its length.
    fn on_item_processed(&self, _index: usize, _total: Option<usize>) {}

    fn on_error(&self, _error: &Error) {}

    /// Fired exactly once per run that produced at least one item.
    fn on_complete(&self, _stats: &RunStatistics) {}

    fn on_warning(&self, _message: &str) {}

    /// Periodic countdown while the retry queue waits for a rate-limit reset.
    fn on_countdown(&self, _remaining: Duration, _queued: usize) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Observer that reports through `tracing`.
#[derive(Debug, Clone)]
pub struct TracingObserver {
    /// Log per-item progress every `every` items.
    every: usize,
}

impl TracingObserver {
    pub fn new(every: usize) -> Self {
        Self { every: every.max(1) }
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new(25)
    }
}

impl RunObserver for TracingObserver {
    fn on_start(&self, source: &str) {
        info!(source = %source, "Run started");
    }

    fn on_item_processed(&self, index: usize, total: Option<usize>) {
        let done = index + 1;
        if done % self.every != 0 {
            return;
        }
        match total {
            Some(total) => info!(done, total, "Processed items"),
            None => info!(done, "Processed items"),
        }
    }

    fn on_error(&self, error: &Error) {
        warn!(error = %error, "Item failed");
    }

    fn on_complete(&self, stats: &RunStatistics) {
        info!(
            produced = stats.items_produced,
            consumed = stats.items_consumed,
            duplicates = stats.duplicates_filtered,
            filtered = stats.filtered,
            errors = stats.errors,
            aborted = stats.aborted,
            "Run complete"
        );
    }

    fn on_warning(&self, message: &str) {
        warn!("{message}");
    }

    fn on_countdown(&self, remaining: Duration, queued: usize) {
        info!(
            remaining_secs = remaining.as_secs(),
            queued, "Waiting for rate limit reset"
        );
    }
}
