//! mbox archive source.

use std::path::PathBuf;

use futures::stream::BoxStream;
use tracing::debug;

use crate::error::SourceError;
use crate::pipeline::source::Source;
use crate::pipeline::types::RawItem;
use crate::sources::mail::parse_messages;
use crate::sources::{SourceConfig, deferred, select};

/// Messages from a single mbox file.
pub struct MailboxSource {
    name: String,
    config: SourceConfig,
}

impl MailboxSource {
    pub fn new(config: SourceConfig) -> Self {
        let file = config
            .path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name: format!("mailbox:{file}"),
            config,
        }
    }

    async fn load(&self) -> Result<Vec<RawItem>, SourceError> {
        let path = self.config.path.clone().unwrap_or_else(PathBuf::new);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| SourceError::Io { path: path.clone(), source })?;

        let messages = split_mbox(&bytes);
        let items = parse_messages(messages.iter().map(Vec::as_slice), &self.name);
        debug!(path = %path.display(), messages = items.len(), "Mailbox loaded");
        Ok(select(items, &self.config))
    }
}

impl Source for MailboxSource {
    type Item = RawItem;

    fn name(&self) -> &str {
        &self.name
    }

    fn produce(&self) -> BoxStream<'_, Result<RawItem, SourceError>> {
        deferred(self.load())
    }
}

/// Split an mbox archive into raw messages.
///
/// A message starts at a `From ` line at the top of the file or after a
/// blank line. `>From ` escapes in bodies are undone.
fn split_mbox(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut messages = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    let mut previous_blank = true;

    for line in bytes.split_inclusive(|b| *b == b'\n') {
        if previous_blank && line.starts_with(b"From ") {
            if let Some(message) = current.take() {
                messages.push(message);
            }
            current = Some(Vec::new());
            previous_blank = false;
            continue;
        }
        previous_blank = line.iter().all(|b| b.is_ascii_whitespace());

        if let Some(message) = current.as_mut() {
            match line.strip_prefix(b">") {
                Some(rest) if rest.starts_with(b"From ") => message.extend_from_slice(rest),
                _ => message.extend_from_slice(line),
            }
        }
    }
    if let Some(message) = current {
        messages.push(message);
    }

    messages.retain(|m| m.iter().any(|b| !b.is_ascii_whitespace()));
    messages
}
