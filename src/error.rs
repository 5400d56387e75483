//! Error types for linkflow.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Stage error: {0}")]
    Stage(#[from] StageError),
}

/// Configuration errors. Always raised before any I/O happens.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Credentials required for source {source_name}: missing {field}")]
    CredentialsRequired { source_name: String, field: String },

    #[error("Path required for source {source_name}")]
    PathRequired { source_name: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown source kind: '{0}' (expected mailbox, directory or imap)")]
    UnknownSource(String),

    #[error("Unknown stage: '{0}' (expected normalize, exclude or enrich)")]
    UnknownStage(String),
}

/// Errors raised while iterating a source. These abort the run.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IMAP error on {host}: {reason}")]
    Imap { host: String, reason: String },

    #[error("Source task failed: {0}")]
    Task(String),
}

/// Per-item stage failures. Recovered by the executor.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("Stage {stage} failed: {reason}")]
    Failed { stage: String, reason: String },
}

/// Errors from external enrichment services.
#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    #[error("Service {service} rate limited, resets at {reset_at:?}")]
    RateLimited {
        service: String,
        reset_at: Option<DateTime<Utc>>,
    },

    #[error("Authentication failed for service {service}")]
    AuthFailed { service: String },

    #[error("Service {service} request failed: {reason}")]
    RequestFailed { service: String, reason: String },

    #[error("Invalid response from {service}: {reason}")]
    InvalidResponse { service: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Export sink errors. Recovered per sink.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Sink {sink} failed to write {path}: {source}")]
    Io {
        sink: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Sink {sink} failed: {reason}")]
    Sink { sink: String, reason: String },
}

/// Result type alias for linkflow.
pub type Result<T> = std::result::Result<T, Error>;
