//! Rate-limit retry queue.
//!
//! Items whose enrichment was throttled during the main pass are queued
//! here. The manager waits out the advertised reset window and retries
//! each queued item once per cycle, within a bounded attempt budget.
//!
//! ```text
//! Unresolved ──▶ Analyzed
//!     │
//!     └──▶ Queued ──▶ Analyzed | Exhausted | Failed
//! ```

pub mod manager;

pub use manager::{RetryQueueManager, RetryReport};

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enrich::Throttled;
use crate::pipeline::types::NormalizedItem;

/// Retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Rate-limited retries per entry before it is exhausted. At least 1.
    pub max_attempts: u32,
    /// Added to every wait window.
    pub safety_buffer: Duration,
    /// Ceiling for the first wait; beyond it nothing is retried.
    pub max_wait: Duration,
    /// Countdown notification period during a wait.
    pub progress_interval: Duration,
    /// Assumed window when no reset time is known.
    pub fallback_window: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            safety_buffer: Duration::from_secs(5),
            max_wait: Duration::from_secs(15 * 60),
            progress_interval: Duration::from_secs(30),
            fallback_window: Duration::from_secs(60),
        }
    }
}

/// A throttled item waiting for another enrichment attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub item: NormalizedItem,
    /// Position of the item in the consumer's results.
    pub original_index: usize,
    /// Rate-limited retries so far.
    pub attempts: u32,
    /// Latest reset time reported for this entry.
    pub reset_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new(item: NormalizedItem, original_index: usize) -> Self {
        Self {
            item,
            original_index,
            attempts: 0,
            reset_at: None,
        }
    }
}

/// Queue entries for the throttled items found in `results`.
///
/// Items are located by identifier. Unknown identifiers, items that are
/// already complete, and repeats are skipped.
pub fn collect_entries(results: &[NormalizedItem], throttled: Vec<Throttled>) -> Vec<QueueEntry> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, item) in results.iter().enumerate() {
        index.entry(item.identifier.as_str()).or_insert(i);
    }

    let mut entries: Vec<QueueEntry> = Vec::new();
    for t in throttled {
        let Some(&i) = index.get(t.identifier.as_str()) else {
            continue;
        };
        if results[i].is_complete() {
            continue;
        }
        match entries.iter_mut().find(|e| e.original_index == i) {
            Some(existing) => existing.reset_at = existing.reset_at.max(t.reset_at),
            None => {
                let mut entry = QueueEntry::new(results[i].clone(), i);
                entry.reset_at = t.reset_at;
                entries.push(entry);
            }
        }
    }
    entries
}

/// Time to wait before retrying: until `reset_at` plus `buffer`.
///
/// Never negative. An unknown reset waits `fallback` plus `buffer`.
pub fn wait_window(
    reset_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    buffer: Duration,
    fallback: Duration,
) -> Duration {
    let until_reset = match reset_at {
        Some(reset) => (reset - now).to_std().unwrap_or(Duration::ZERO),
        None => fallback,
    };
    until_reset + buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(identifier: &str) -> NormalizedItem {
        NormalizedItem::new(identifier, "test", Utc::now())
    }

    fn throttled(identifier: &str, reset_at: Option<DateTime<Utc>>) -> Throttled {
        Throttled {
            identifier: identifier.into(),
            reset_at,
        }
    }

    // ── wait_window ─────────────────────────────────────────────

    #[test]
    fn window_is_reset_plus_buffer() {
        let now = Utc::now();
        let reset = now + chrono::Duration::seconds(10);
        let wait = wait_window(Some(reset), now, Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(wait, Duration::from_secs(15));
    }

    #[test]
    fn past_reset_waits_only_the_buffer() {
        let now = Utc::now();
        let reset = now - chrono::Duration::seconds(30);
        let wait = wait_window(Some(reset), now, Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(wait, Duration::from_secs(5));
    }

    #[test]
    fn unknown_reset_uses_fallback() {
        let wait = wait_window(None, Utc::now(), Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(wait, Duration::from_secs(65));
    }

    // ── collect_entries ─────────────────────────────────────────

    #[test]
    fn entries_point_at_original_positions() {
        let results = vec![item("https://a.example/"), item("https://b.example/"), item("https://c.example/")];
        let entries = collect_entries(
            &results,
            vec![throttled("https://c.example/", None), throttled("https://a.example/", None)],
        );

        let indexes: Vec<usize> = entries.iter().map(|e| e.original_index).collect();
        assert_eq!(indexes, vec![2, 0]);
        assert!(entries.iter().all(|e| e.attempts == 0 && e.reset_at.is_none()));
    }

    #[test]
    fn complete_unknown_and_repeated_items_are_skipped() {
        let reset = Utc::now() + chrono::Duration::seconds(30);
        let results = vec![
            item("https://a.example/").with_analysis(crate::pipeline::types::Analysis::new("Tech", "done")),
            item("https://b.example/"),
        ];
        let entries = collect_entries(
            &results,
            vec![
                throttled("https://a.example/", None),
                throttled("https://gone.example/", None),
                throttled("https://b.example/", None),
                throttled("https://b.example/", Some(reset)),
            ],
        );

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].original_index, 1);
        assert_eq!(entries[0].reset_at, Some(reset));
    }
}
