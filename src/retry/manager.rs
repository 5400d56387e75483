//! The retry loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::enrich::{AnalysisOutcome, Analyzer};
use crate::pipeline::types::NormalizedItem;
use crate::progress::RunObserver;
use crate::retry::{QueueEntry, RetryConfig, wait_window};

/// What the retry pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    /// Entries handed to the manager.
    pub queued: usize,
    /// Entries attempted at least once.
    pub retried: usize,
    pub resolved: usize,
    pub exhausted: usize,
    /// Hard errors during retry.
    pub failed: usize,
    /// Entries never attempted because the first wait exceeded the ceiling.
    pub skipped: usize,
    /// Entries still queued when the loop ended.
    pub unresolved: usize,
    pub cycles: usize,
    /// Identifiers rewritten in place, for `Exporter::update_existing`.
    pub updated: Vec<String>,
}

impl RetryReport {
    /// Terminal outcomes plus attempts spent. The loop stops when a cycle
    /// leaves this unchanged.
    fn ledger(&self, attempts_spent: u64) -> u64 {
        (self.resolved + self.exhausted + self.failed) as u64 + attempts_spent
    }
}

/// Re-drives throttled items after their rate-limit window.
pub struct RetryQueueManager {
    analyzer: Arc<Analyzer>,
    config: RetryConfig,
    observer: Arc<dyn RunObserver>,
}

impl RetryQueueManager {
    pub fn new(analyzer: Arc<Analyzer>, config: RetryConfig, observer: Arc<dyn RunObserver>) -> Self {
        Self {
            analyzer,
            config,
            observer,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retry `entries`, writing successes into `results` at each entry's
    /// original index.
    ///
    /// Never fails: exhausted and failed entries keep their pre-retry
    /// classification.
    pub async fn run(&self, entries: Vec<QueueEntry>, results: &mut [NormalizedItem]) -> RetryReport {
        let mut report = RetryReport {
            queued: entries.len(),
            ..RetryReport::default()
        };
        if entries.is_empty() {
            return report;
        }

        let limiter = Arc::clone(self.analyzer.limiter());
        let max_attempts = self.config.max_attempts;
        let mut queue = entries;
        let mut retried: HashSet<usize> = HashSet::new();
        let mut attempts_spent: u64 = 0;

        info!(queued = queue.len(), max_attempts, "Starting rate-limit retry queue");

        loop {
            let reset = self.reset_estimate(limiter.reset_time(), &queue);
            let wait = wait_window(
                reset,
                Utc::now(),
                self.config.safety_buffer,
                self.config.fallback_window,
            );

            if report.cycles == 0 && wait > self.config.max_wait {
                warn!(
                    wait_secs = wait.as_secs(),
                    max_wait_secs = self.config.max_wait.as_secs(),
                    queued = queue.len(),
                    "Rate-limit reset beyond wait ceiling, skipping retries"
                );
                self.observer.on_warning(&format!(
                    "Rate limit resets in {}s (ceiling {}s); {} item(s) left unclassified",
                    wait.as_secs(),
                    self.config.max_wait.as_secs(),
                    queue.len()
                ));
                report.skipped = queue.len();
                break;
            }

            let before = report.ledger(attempts_spent);
            self.countdown(wait, queue.len()).await;
            report.cycles += 1;

            // A reset later than the one just waited for means the service
            // is still throttled: nothing is attempted this cycle.
            let still_limited = matches!(
                (limiter.reset_time(), reset),
                (Some(current), Some(waited)) if current > waited
            );

            if still_limited {
                debug!(cycle = report.cycles, "Still rate limited after wait");
            } else {
                limiter.clear_rate_limit();
                let mut requeue = Vec::with_capacity(queue.len());
                for mut entry in queue.drain(..) {
                    retried.insert(entry.original_index);
                    match self.analyzer.analyze(&entry.item).await {
                        AnalysisOutcome::Analyzed(analysis) => {
                            self.write_back(&entry, entry.item.clone().with_analysis(analysis), results, &mut report);
                        }
                        AnalysisOutcome::RateLimited { reset_at } => {
                            entry.attempts += 1;
                            attempts_spent += 1;
                            entry.reset_at = reset_at;
                            if entry.attempts >= max_attempts {
                                report.exhausted += 1;
                                debug!(identifier = %entry.item.identifier, attempts = entry.attempts, "Retry budget exhausted");
                            } else {
                                requeue.push(entry);
                            }
                        }
                        AnalysisOutcome::Failed(e) => {
                            report.failed += 1;
                            warn!(identifier = %entry.item.identifier, error = %e, "Retry failed with a hard error");
                        }
                    }
                }
                queue = requeue;
            }

            info!(
                cycle = report.cycles,
                resolved = report.resolved,
                exhausted = report.exhausted,
                remaining = queue.len(),
                "Retry cycle complete"
            );

            if queue.is_empty() {
                break;
            }
            if report.ledger(attempts_spent) == before {
                warn!(cycle = report.cycles, remaining = queue.len(), "Retry cycle made no progress, stopping");
                self.observer
                    .on_warning(&format!("Retry stopped without progress; {} item(s) unresolved", queue.len()));
                break;
            }
        }

        report.retried = retried.len();
        if report.skipped == 0 {
            report.unresolved = queue.len();
        }
        info!(
            resolved = report.resolved,
            exhausted = report.exhausted,
            failed = report.failed,
            skipped = report.skipped,
            cycles = report.cycles,
            "Retry queue finished"
        );
        report
    }

    /// Latest known reset across the limiter and the queued entries.
    fn reset_estimate(&self, limiter_reset: Option<DateTime<Utc>>, queue: &[QueueEntry]) -> Option<DateTime<Utc>> {
        queue.iter().filter_map(|e| e.reset_at).chain(limiter_reset).max()
    }

    fn write_back(
        &self,
        entry: &QueueEntry,
        updated: NormalizedItem,
        results: &mut [NormalizedItem],
        report: &mut RetryReport,
    ) {
        let Some(slot) = results.get_mut(entry.original_index) else {
            warn!(index = entry.original_index, "Retry result has no slot, dropping");
            return;
        };
        debug!(identifier = %updated.identifier, index = entry.original_index, "Retry resolved");
        report.updated.push(updated.identifier.clone());
        report.resolved += 1;
        *slot = updated;
    }

    /// One shared sleep for the whole queue, with periodic countdowns.
    async fn countdown(&self, wait: Duration, queued: usize) {
        let deadline = Instant::now() + wait;
        self.observer.on_countdown(wait, queued);

        let period = self.config.progress_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = &mut sleep => break,
                _ = ticker.tick() => {
                    self.observer.on_countdown(deadline.saturating_duration_since(Instant::now()), queued);
                }
            }
        }
    }
}
