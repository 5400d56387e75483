//! Configuration, read from environment variables.
//!
//! Everything is optional except `LINKFLOW_SOURCE`. Malformed values fail
//! fast with the variable name; a missing optional value falls back to
//! its default.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::pipeline::stages::{DEFAULT_MAX_LINKS, StageKind};
use crate::retry::RetryConfig;
use crate::sources::{Credentials, DataSourceKind, SourceConfig};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_IMAP_PORT: u16 = 993;

/// Which source to read and how.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub kind: DataSourceKind,
    pub source: SourceConfig,
}

/// Item stages after extraction.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub stages: Vec<StageKind>,
    pub exclude_domains: Vec<String>,
    /// Links taken from each raw item.
    pub max_links: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            stages: StageKind::ALL.to_vec(),
            exclude_domains: Vec::new(),
            max_links: DEFAULT_MAX_LINKS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    /// Required only when the enrich stage is configured.
    pub api_key: Option<SecretString>,
    pub model: String,
    /// Overrides the built-in category list when non-empty.
    pub categories: Vec<String>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            categories: Vec::new(),
        }
    }
}

/// Output files. Each one set enables its sink.
#[derive(Debug, Clone, Default)]
pub struct ExportSettings {
    pub csv_path: Option<PathBuf>,
    pub jsonl_path: Option<PathBuf>,
}

/// Complete run configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub source: SourceSettings,
    pub pipeline: PipelineSettings,
    pub classifier: ClassifierSettings,
    pub retry: RetryConfig,
    pub export: ExportSettings,
    /// Daily-rolling log files go here when set.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let present = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let env = Env { lookup: &present };

        let source = env.source()?;
        let pipeline = env.pipeline()?;
        let classifier = ClassifierSettings {
            api_key: env.get("ANTHROPIC_API_KEY").map(SecretString::from),
            model: env.get("LINKFLOW_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            categories: env.list("LINKFLOW_CATEGORIES"),
        };

        if pipeline.stages.contains(&StageKind::Enrich) && classifier.api_key.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "ANTHROPIC_API_KEY".into(),
                hint: "export ANTHROPIC_API_KEY=sk-ant-... or drop 'enrich' from LINKFLOW_STAGES".into(),
            });
        }

        Ok(Self {
            source,
            pipeline,
            classifier,
            retry: env.retry()?,
            export: ExportSettings {
                csv_path: env.get("LINKFLOW_CSV_PATH").map(PathBuf::from),
                jsonl_path: env.get("LINKFLOW_JSONL_PATH").map(PathBuf::from),
            },
            log_dir: env.get("LINKFLOW_LOG_DIR").map(PathBuf::from),
        })
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string())
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{raw:?}: {e}"),
                })
            })
            .transpose()
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs).unwrap_or(default))
    }

    fn source(&self) -> Result<SourceSettings, ConfigError> {
        let kind = self.get("LINKFLOW_SOURCE").ok_or_else(|| ConfigError::MissingRequired {
            key: "LINKFLOW_SOURCE".into(),
            hint: "one of: mailbox, directory, imap".into(),
        })?;
        let kind = DataSourceKind::parse(&kind)?;

        let since = self
            .get("LINKFLOW_SINCE")
            .map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|at| at.with_timezone(&Utc))
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "LINKFLOW_SINCE".into(),
                        message: format!("{raw:?}: {e}"),
                    })
            })
            .transpose()?;

        let credentials = match self.get("LINKFLOW_IMAP_HOST") {
            Some(host) => Some(Credentials {
                host,
                port: self.parse("LINKFLOW_IMAP_PORT")?.unwrap_or(DEFAULT_IMAP_PORT),
                username: self.get("LINKFLOW_IMAP_USERNAME").unwrap_or_default(),
                password: SecretString::from(self.get("IMAP_PASSWORD").unwrap_or_default()),
            }),
            None => None,
        };

        Ok(SourceSettings {
            kind,
            source: SourceConfig {
                since,
                limit: self.parse("LINKFLOW_LIMIT")?,
                path: self.get("LINKFLOW_PATH").map(PathBuf::from),
                credentials,
                folder: self.get("LINKFLOW_IMAP_FOLDER"),
            },
        })
    }

    fn pipeline(&self) -> Result<PipelineSettings, ConfigError> {
        let defaults = PipelineSettings::default();
        let stages = match self.get("LINKFLOW_STAGES") {
            Some(list) => StageKind::parse_list(&list)?,
            None => defaults.stages,
        };
        let max_links = self.parse::<usize>("LINKFLOW_MAX_LINKS")?.unwrap_or(defaults.max_links);
        if max_links == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LINKFLOW_MAX_LINKS".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(PipelineSettings {
            stages,
            exclude_domains: self.list("LINKFLOW_EXCLUDE_DOMAINS"),
            max_links,
        })
    }

    fn retry(&self) -> Result<RetryConfig, ConfigError> {
        let defaults = RetryConfig::default();
        let max_attempts = self
            .parse::<u32>("LINKFLOW_RETRY_MAX_ATTEMPTS")?
            .unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "LINKFLOW_RETRY_MAX_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(RetryConfig {
            max_attempts,
            safety_buffer: self.secs("LINKFLOW_RETRY_BUFFER_SECS", defaults.safety_buffer)?,
            max_wait: self.secs("LINKFLOW_RETRY_MAX_WAIT_SECS", defaults.max_wait)?,
            progress_interval: self.secs("LINKFLOW_RETRY_PROGRESS_SECS", defaults.progress_interval)?,
            fallback_window: self.secs("LINKFLOW_RETRY_FALLBACK_SECS", defaults.fallback_window)?,
        })
    }
}
