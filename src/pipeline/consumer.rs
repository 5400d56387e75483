//! Terminal sinks for pipeline output.

use std::collections::HashSet;

use tracing::debug;

use crate::pipeline::types::NormalizedItem;

/// What the consumer did with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumed {
    Accepted,
    Duplicate,
}

/// Terminal accumulator for pipeline output.
///
/// `consume` may be called more than once with the same item; duplicates
/// are counted rather than stored twice. `results` is readable at any
/// point of a run, for progress reporting.
pub trait Consumer<T>: Send {
    fn consume(&mut self, item: T) -> Consumed;

    /// Accumulated items, in acceptance order.
    fn results(&self) -> &[T];

    /// Mutable view for in-place rewrites after the main pass.
    fn results_mut(&mut self) -> &mut [T];

    /// Number of items rejected as duplicates.
    fn duplicates(&self) -> usize;
}

type KeyFn<T> = Box<dyn Fn(&T) -> String + Send>;

/// Collects every item into a `Vec`, optionally de-duplicating by key.
pub struct CollectingConsumer<T> {
    items: Vec<T>,
    seen: HashSet<String>,
    key: Option<KeyFn<T>>,
    duplicates: usize,
}

impl<T> CollectingConsumer<T> {
    /// Keep everything, duplicates included.
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            seen: HashSet::new(),
            key: None,
            duplicates: 0,
        }
    }

    /// Keep only the first item for each key.
    pub fn dedup_by(key: impl Fn(&T) -> String + Send + 'static) -> Self {
        Self {
            key: Some(Box::new(key)),
            ..Self::new()
        }
    }

    /// Take the accumulated items, ending the run.
    pub fn into_results(self) -> Vec<T> {
        self.items
    }
}

impl CollectingConsumer<NormalizedItem> {
    /// Link collector: one entry per identifier.
    pub fn links() -> Self {
        Self::dedup_by(|item: &NormalizedItem| item.identifier.clone())
    }
}

impl<T> Default for CollectingConsumer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Consumer<T> for CollectingConsumer<T> {
    fn consume(&mut self, item: T) -> Consumed {
        if let Some(key_fn) = &self.key {
            let key = key_fn(&item);
            if !self.seen.insert(key.clone()) {
                debug!(key = %key, "Duplicate item dropped");
                self.duplicates += 1;
                return Consumed::Duplicate;
            }
        }
        self.items.push(item);
        Consumed::Accepted
    }

    fn results(&self) -> &[T] {
        &self.items
    }

    fn results_mut(&mut self) -> &mut [T] {
        &mut self.items
    }

    fn duplicates(&self) -> usize {
        self.duplicates
    }
}
