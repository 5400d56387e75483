//! JSON-lines export.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::ExportError;
use crate::export::{Exporter, merge_updates};
use crate::pipeline::types::NormalizedItem;

/// One JSON object per line.
#[derive(Debug, Clone)]
pub struct JsonlExporter {
    path: PathBuf,
}

impl JsonlExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> ExportError {
        ExportError::Io {
            sink: "jsonl".into(),
            path: self.path.clone(),
            source,
        }
    }

    async fn read_rows(&self) -> Result<Vec<NormalizedItem>, ExportError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(ExportError::from))
            .collect()
    }

    async fn write_rows(&self, items: &[NormalizedItem]) -> Result<usize, ExportError> {
        let mut out = String::new();
        for item in items {
            out.push_str(&serde_json::to_string(item)?);
            out.push('\n');
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| self.io_error(e))?;
        }
        tokio::fs::write(&self.path, out).await.map_err(|e| self.io_error(e))?;
        Ok(items.len())
    }
}

#[async_trait]
impl Exporter for JsonlExporter {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn write(&self, items: &[NormalizedItem]) -> Result<usize, ExportError> {
        self.write_rows(items).await
    }

    async fn update_existing(&self, items: &[NormalizedItem], identifiers: &[String]) -> Result<usize, ExportError> {
        let mut rows = self.read_rows().await?;
        let touched = merge_updates(&mut rows, items, identifiers);
        self.write_rows(&rows).await?;
        Ok(touched)
    }
}
