//! Source port: the producer side of a run.

use futures::stream::{self, BoxStream, StreamExt};

use crate::error::SourceError;

/// Produces a lazy, finite sequence of items.
///
/// Iteration may suspend on I/O between items. A source is not
/// rewindable: to run again (for example with a newer "since"
/// timestamp), construct a new one with updated parameters.
pub trait Source: Send + Sync {
    type Item: Send + 'static;

    /// Label for logs and item origins.
    fn name(&self) -> &str;

    /// Number of items, when known up front.
    fn size_hint(&self) -> Option<usize> {
        None
    }

    fn produce(&self) -> BoxStream<'_, Result<Self::Item, SourceError>>;
}

/// In-memory source over a fixed list of results.
pub struct IterSource<T> {
    name: String,
    items: Vec<Result<T, String>>,
}

impl<T: Clone + Send + Sync + 'static> IterSource<T> {
    pub fn new(name: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            name: name.into(),
            items: items.into_iter().map(Ok).collect(),
        }
    }

    /// Source whose iteration fails at position `at` with `reason`.
    pub fn failing_at(name: impl Into<String>, items: Vec<T>, at: usize, reason: impl Into<String>) -> Self {
        let mut source = Self::new(name, items);
        let at = at.min(source.items.len());
        source.items.insert(at, Err(reason.into()));
        source
    }
}

impl<T: Clone + Send + Sync + 'static> Source for IterSource<T> {
    type Item = T;

    fn name(&self) -> &str {
        &self.name
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.items.iter().filter(|r| r.is_ok()).count())
    }

    fn produce(&self) -> BoxStream<'_, Result<T, SourceError>> {
        stream::iter(self.items.iter())
            .map(|r| r.clone().map_err(SourceError::Task))
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn iter_source_yields_in_order() {
        let source = IterSource::new("nums", vec![1, 2, 3]);
        let items: Vec<i32> = source.produce().map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(source.size_hint(), Some(3));
    }

    #[tokio::test]
    async fn failing_source_yields_error_in_position() {
        let source = IterSource::failing_at("nums", vec![1, 2], 1, "disk gone");
        let results: Vec<Result<i32, SourceError>> = source.produce().collect().await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }
}
