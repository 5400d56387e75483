//! Concrete data sources.
//!
//! The set is closed: [`DataSourceKind`] names the variants and
//! [`DataSource::open`] builds one after checking the variant's declared
//! [`Requirement`]. Every source loads its messages on first poll, then
//! applies the shared `since`/`limit` selection.

pub mod directory;
pub mod imap;
pub mod ingest;
pub mod mail;
pub mod mailbox;

pub use directory::DirectorySource;
pub use imap::ImapSource;
pub use ingest::Ingestion;
pub use mailbox::MailboxSource;

use std::future::Future;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ConfigError, SourceError};
use crate::pipeline::source::Source;
use crate::pipeline::types::RawItem;

// ── Configuration ───────────────────────────────────────────────────

/// IMAP login details.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

/// Parameters of one source run.
///
/// Sources are not rewindable: a later run with a newer `since` builds a
/// new source from an updated config.
#[derive(Debug, Clone, Default)]
pub struct SourceConfig {
    /// Only items received at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// At most this many items.
    pub limit: Option<usize>,
    pub path: Option<PathBuf>,
    pub credentials: Option<Credentials>,
    /// IMAP folder; `INBOX` when unset.
    pub folder: Option<String>,
}

impl SourceConfig {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Same parameters with a newer lower bound.
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// What a source needs from its config before it can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Credentials,
    Path,
}

impl Requirement {
    /// Fail fast, naming the missing field.
    pub fn check(self, source_name: &str, config: &SourceConfig) -> Result<(), ConfigError> {
        match self {
            Self::Path => match &config.path {
                Some(path) if !path.as_os_str().is_empty() => Ok(()),
                _ => Err(ConfigError::PathRequired {
                    source_name: source_name.to_string(),
                }),
            },
            Self::Credentials => {
                let missing = |field: &str| ConfigError::CredentialsRequired {
                    source_name: source_name.to_string(),
                    field: field.to_string(),
                };
                let credentials = config.credentials.as_ref().ok_or_else(|| missing("credentials"))?;
                if credentials.host.trim().is_empty() {
                    return Err(missing("host"));
                }
                if credentials.username.trim().is_empty() {
                    return Err(missing("username"));
                }
                if credentials.password.expose_secret().is_empty() {
                    return Err(missing("password"));
                }
                Ok(())
            }
        }
    }
}

// ── Source kinds ────────────────────────────────────────────────────

/// The closed set of source variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceKind {
    Mailbox,
    Directory,
    Imap,
}

impl DataSourceKind {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mailbox" | "mbox" => Ok(Self::Mailbox),
            "directory" | "dir" => Ok(Self::Directory),
            "imap" => Ok(Self::Imap),
            other => Err(ConfigError::UnknownSource(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mailbox => "mailbox",
            Self::Directory => "directory",
            Self::Imap => "imap",
        }
    }

    pub fn requirement(self) -> Requirement {
        match self {
            Self::Mailbox | Self::Directory => Requirement::Path,
            Self::Imap => Requirement::Credentials,
        }
    }
}

impl std::fmt::Display for DataSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured source of any kind.
pub enum DataSource {
    Mailbox(MailboxSource),
    Directory(DirectorySource),
    Imap(ImapSource),
}

impl DataSource {
    /// Validate `config` against the kind's requirement and build the source.
    pub fn open(kind: DataSourceKind, config: &SourceConfig) -> Result<Self, ConfigError> {
        kind.requirement().check(kind.as_str(), config)?;
        let config = config.clone();
        Ok(match kind {
            DataSourceKind::Mailbox => Self::Mailbox(MailboxSource::new(config)),
            DataSourceKind::Directory => Self::Directory(DirectorySource::new(config)),
            DataSourceKind::Imap => Self::Imap(ImapSource::new(config)),
        })
    }
}

impl Source for DataSource {
    type Item = RawItem;

    fn name(&self) -> &str {
        match self {
            Self::Mailbox(s) => s.name(),
            Self::Directory(s) => s.name(),
            Self::Imap(s) => s.name(),
        }
    }

    fn produce(&self) -> BoxStream<'_, Result<RawItem, SourceError>> {
        match self {
            Self::Mailbox(s) => s.produce(),
            Self::Directory(s) => s.produce(),
            Self::Imap(s) => s.produce(),
        }
    }
}

// ── Shared helpers ──────────────────────────────────────────────────

/// Keep items at or after `since`, then the first `limit`.
///
/// Items without a timestamp are kept.
pub(crate) fn select(items: Vec<RawItem>, config: &SourceConfig) -> Vec<RawItem> {
    let selected = items
        .into_iter()
        .filter(|item| match (config.since, item.received_at) {
            (Some(since), Some(at)) => at >= since,
            _ => true,
        });
    match config.limit {
        Some(limit) => selected.take(limit).collect(),
        None => selected.collect(),
    }
}

/// Stream over items loaded by `load` on first poll.
pub(crate) fn deferred<'a, F>(load: F) -> BoxStream<'a, Result<RawItem, SourceError>>
where
    F: Future<Output = Result<Vec<RawItem>, SourceError>> + Send + 'a,
{
    stream::once(load)
        .flat_map(|loaded| match loaded {
            Ok(items) => stream::iter(items.into_iter().map(Ok)).boxed(),
            Err(e) => stream::iter([Err(e)]).boxed(),
        })
        .boxed()
}
