//! CSV export.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::ExportError;
use crate::export::{Exporter, merge_updates};
use crate::pipeline::types::NormalizedItem;

/// One row per link, with a header.
///
/// Columns follow [`NormalizedItem`]'s fields. File work runs on the
/// blocking pool.
#[derive(Debug, Clone)]
pub struct CsvExporter {
    path: PathBuf,
}

impl CsvExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, ExportError>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> Result<T, ExportError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || f(path))
            .await
            .map_err(|e| ExportError::Sink {
                sink: "csv".into(),
                reason: e.to_string(),
            })?
    }
}

fn write_rows(path: &Path, items: &[NormalizedItem]) -> Result<usize, ExportError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| ExportError::Io {
            sink: "csv".into(),
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    for item in items {
        writer.serialize(item)?;
    }
    writer.flush().map_err(|source| ExportError::Io {
        sink: "csv".into(),
        path: path.to_path_buf(),
        source,
    })?;
    Ok(items.len())
}

fn read_rows(path: &Path) -> Result<Vec<NormalizedItem>, ExportError> {
    let mut reader = match csv::Reader::from_path(path) {
        Ok(reader) => reader,
        Err(e) => {
            if let csv::ErrorKind::Io(io) = e.kind()
                && io.kind() == ErrorKind::NotFound
            {
                return Ok(Vec::new());
            }
            return Err(e.into());
        }
    };
    reader
        .deserialize()
        .collect::<Result<Vec<NormalizedItem>, csv::Error>>()
        .map_err(ExportError::from)
}

#[async_trait]
impl Exporter for CsvExporter {
    fn name(&self) -> &str {
        "csv"
    }

    async fn write(&self, items: &[NormalizedItem]) -> Result<usize, ExportError> {
        let items = items.to_vec();
        self.blocking(move |path| write_rows(&path, &items)).await
    }

    async fn update_existing(&self, items: &[NormalizedItem], identifiers: &[String]) -> Result<usize, ExportError> {
        let items = items.to_vec();
        let identifiers = identifiers.to_vec();
        self.blocking(move |path| {
            let mut rows = read_rows(&path)?;
            let touched = merge_updates(&mut rows, &items, &identifiers);
            write_rows(&path, &rows)?;
            Ok(touched)
        })
        .await
    }
}
