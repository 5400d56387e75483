//! Directory-of-files source.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::pipeline::source::Source;
use crate::pipeline::types::RawItem;
use crate::sources::SourceConfig;
use crate::sources::mail::{parse_message, strip_html};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Mail,
    Html,
    Text,
}

impl FileKind {
    fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "eml" => Some(Self::Mail),
            "html" | "htm" => Some(Self::Html),
            "txt" | "md" => Some(Self::Text),
            _ => None,
        }
    }
}

struct Entry {
    path: PathBuf,
    kind: FileKind,
    modified: Option<DateTime<Utc>>,
}

/// Files in one directory (not recursive), visited in name order.
///
/// `since` compares file modification time. Files are read one at a time
/// as the stream is polled. An `.eml` file that is not a message is
/// logged and skipped.
pub struct DirectorySource {
    name: String,
    config: SourceConfig,
}

impl DirectorySource {
    pub fn new(config: SourceConfig) -> Self {
        let dir = config
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Self {
            name: format!("directory:{dir}"),
            config,
        }
    }

    async fn list(&self) -> Result<Vec<Entry>, SourceError> {
        let dir = self.config.path.clone().unwrap_or_else(PathBuf::new);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| SourceError::Io { path, source }
        };

        let mut reader = tokio::fs::read_dir(&dir).await.map_err(io_err(&dir))?;
        let mut entries = Vec::new();
        while let Some(dir_entry) = reader.next_entry().await.map_err(io_err(&dir))? {
            let path = dir_entry.path();
            let Some(kind) = FileKind::of(&path) else {
                debug!(path = %path.display(), "Skipping unsupported file");
                continue;
            };
            let metadata = dir_entry.metadata().await.map_err(io_err(&path))?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            entries.push(Entry { path, kind, modified });
        }
        entries.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));

        let selected = entries.into_iter().filter(|e| match (self.config.since, e.modified) {
            (Some(since), Some(at)) => at >= since,
            _ => true,
        });
        Ok(match self.config.limit {
            Some(limit) => selected.take(limit).collect(),
            None => selected.collect(),
        })
    }

    async fn read(&self, entry: Entry) -> Result<Option<RawItem>, SourceError> {
        let bytes = tokio::fs::read(&entry.path)
            .await
            .map_err(|source| SourceError::Io {
                path: entry.path.clone(),
                source,
            })?;
        let file_name = entry
            .path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let origin = format!("{}/{file_name}", self.name);

        let mut item = match entry.kind {
            FileKind::Mail => match parse_message(&bytes, &origin) {
                Some(item) => item,
                None => {
                    warn!(path = %entry.path.display(), "Skipping unparseable message");
                    return Ok(None);
                }
            },
            FileKind::Html => {
                RawItem::new(&origin, strip_html(&String::from_utf8_lossy(&bytes))).with_subject(&file_name)
            }
            FileKind::Text => RawItem::new(&origin, String::from_utf8_lossy(&bytes)).with_subject(&file_name),
        };
        if item.received_at.is_none()
            && let Some(modified) = entry.modified
        {
            item = item.with_received_at(modified);
        }
        Ok(Some(item))
    }
}

impl Source for DirectorySource {
    type Item = RawItem;

    fn name(&self) -> &str {
        &self.name
    }

    fn produce(&self) -> BoxStream<'_, Result<RawItem, SourceError>> {
        stream::once(self.list())
            .flat_map(|listed| match listed {
                Ok(entries) => stream::iter(entries.into_iter().map(Ok)).boxed(),
                Err(e) => stream::iter([Err(e)]).boxed(),
            })
            .then(move |entry| async move {
                match entry {
                    Ok(entry) => self.read(entry).await,
                    Err(e) => Err(e),
                }
            })
            .filter_map(|read| future::ready(read.transpose()))
            .boxed()
    }
}
