//! Export sinks.
//!
//! Each sink is independent: one failing sink never rolls back or blocks
//! another. Every sink sees the same item list.

pub mod csv_file;
pub mod jsonl_file;

pub use csv_file::CsvExporter;
pub use jsonl_file::JsonlExporter;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ExportError;
use crate::pipeline::types::NormalizedItem;

/// A destination for a run's results.
#[async_trait]
pub trait Exporter: Send + Sync {
    fn name(&self) -> &str;

    /// Replace the sink's contents with `items`. Returns rows written.
    async fn write(&self, items: &[NormalizedItem]) -> Result<usize, ExportError>;

    /// Rewrite the rows for `identifiers` from `items`, appending the
    /// ones the sink does not have yet. Returns rows touched.
    async fn update_existing(&self, items: &[NormalizedItem], identifiers: &[String]) -> Result<usize, ExportError>;
}

/// Which export call an outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPhase {
    Write,
    Update,
}

/// Result of one sink call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportOutcome {
    pub sink: String,
    pub phase: ExportPhase,
    pub rows: usize,
    pub error: Option<String>,
}

impl ExportOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

fn outcome(sink: &str, phase: ExportPhase, result: Result<usize, ExportError>) -> ExportOutcome {
    match result {
        Ok(rows) => {
            info!(sink, phase = ?phase, rows, "Export complete");
            ExportOutcome {
                sink: sink.to_string(),
                phase,
                rows,
                error: None,
            }
        }
        Err(e) => {
            warn!(sink, phase = ?phase, error = %e, "Export failed");
            ExportOutcome {
                sink: sink.to_string(),
                phase,
                rows: 0,
                error: Some(e.to_string()),
            }
        }
    }
}

/// `write` on every sink.
pub async fn write_all(exporters: &[Arc<dyn Exporter>], items: &[NormalizedItem]) -> Vec<ExportOutcome> {
    let mut outcomes = Vec::with_capacity(exporters.len());
    for exporter in exporters {
        outcomes.push(outcome(exporter.name(), ExportPhase::Write, exporter.write(items).await));
    }
    outcomes
}

/// `update_existing` on every sink. Nothing happens for an empty set.
pub async fn update_all(
    exporters: &[Arc<dyn Exporter>],
    items: &[NormalizedItem],
    identifiers: &[String],
) -> Vec<ExportOutcome> {
    if identifiers.is_empty() {
        return Vec::new();
    }
    let mut outcomes = Vec::with_capacity(exporters.len());
    for exporter in exporters {
        outcomes.push(outcome(
            exporter.name(),
            ExportPhase::Update,
            exporter.update_existing(items, identifiers).await,
        ));
    }
    outcomes
}

/// Merge the updated rows into `existing`, in place.
///
/// Matching identifiers are replaced; unknown ones are appended in the
/// order of `identifiers`. Returns rows touched.
pub(crate) fn merge_updates(
    existing: &mut Vec<NormalizedItem>,
    items: &[NormalizedItem],
    identifiers: &[String],
) -> usize {
    let wanted: HashSet<&str> = identifiers.iter().map(String::as_str).collect();
    let mut updates: HashMap<&str, &NormalizedItem> = items
        .iter()
        .filter(|i| wanted.contains(i.identifier.as_str()))
        .map(|i| (i.identifier.as_str(), i))
        .collect();

    let mut touched = 0;
    for row in existing.iter_mut() {
        if let Some(item) = updates.remove(row.identifier.as_str()) {
            *row = item.clone();
            touched += 1;
        }
    }
    for id in identifiers {
        if let Some(item) = updates.remove(id.as_str()) {
            existing.push(item.clone());
            touched += 1;
        }
    }
    touched
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::pipeline::types::Analysis;

    struct BrokenSink;

    #[async_trait]
    impl Exporter for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        async fn write(&self, _items: &[NormalizedItem]) -> Result<usize, ExportError> {
            Err(ExportError::Sink {
                sink: "broken".into(),
                reason: "disk full".into(),
            })
        }

        async fn update_existing(&self, _items: &[NormalizedItem], _ids: &[String]) -> Result<usize, ExportError> {
            Ok(0)
        }
    }

    fn item(identifier: &str) -> NormalizedItem {
        NormalizedItem::new(identifier, "test", Utc::now())
    }

    #[test]
    fn merge_replaces_then_appends() {
        let mut existing = vec![item("https://a.example/"), item("https://b.example/")];
        let items = vec![
            item("https://b.example/").with_analysis(Analysis::new("Tech", "b")),
            item("https://c.example/").with_analysis(Analysis::new("News", "c")),
            item("https://a.example/").with_analysis(Analysis::new("Other", "not requested")),
        ];
        let ids = vec!["https://c.example/".to_string(), "https://b.example/".to_string()];

        let touched = merge_updates(&mut existing, &items, &ids);

        assert_eq!(touched, 2);
        assert_eq!(existing.len(), 3);
        assert!(!existing[0].is_complete());
        assert_eq!(existing[1].category, "Tech");
        assert_eq!(existing[2].identifier, "https://c.example/");
    }

    #[tokio::test]
    async fn failing_sink_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.jsonl");
        let exporters: Vec<Arc<dyn Exporter>> = vec![Arc::new(BrokenSink), Arc::new(JsonlExporter::new(&path))];

        let outcomes = write_all(&exporters, &[item("https://a.example/")]).await;

        assert!(!outcomes[0].is_ok());
        assert_eq!(outcomes[0].error.as_deref(), Some("Sink broken failed: disk full"));
        assert!(outcomes[1].is_ok());
        assert_eq!(outcomes[1].rows, 1);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn no_updates_no_calls() {
        let exporters: Vec<Arc<dyn Exporter>> = vec![Arc::new(BrokenSink)];
        assert!(update_all(&exporters, &[], &[]).await.is_empty());
    }
}
