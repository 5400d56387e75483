//! Batch ingestion template.
//!
//! `ingest` runs `validate_config → fetch_raw → normalize → enrich`. Each
//! step is a plain function value, so a caller can swap any one of them
//! without defining a new type.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, TryStreamExt};
use tracing::info;

use crate::error::{self, ConfigError, SourceError};
use crate::pipeline::source::Source;
use crate::pipeline::stages::links_from_raw;
use crate::pipeline::types::{NormalizedItem, RawItem};
use crate::sources::{DataSource, DataSourceKind, SourceConfig};

pub type ValidateFn = Arc<dyn Fn(&SourceConfig) -> Result<(), ConfigError> + Send + Sync>;
pub type FetchFn = Arc<dyn Fn(SourceConfig) -> BoxFuture<'static, Result<Vec<RawItem>, SourceError>> + Send + Sync>;
pub type NormalizeFn = Arc<dyn Fn(Vec<RawItem>) -> Vec<NormalizedItem> + Send + Sync>;
pub type EnrichFn = Arc<dyn Fn(Vec<NormalizedItem>) -> BoxFuture<'static, Vec<NormalizedItem>> + Send + Sync>;

/// The four ingestion steps.
#[derive(Clone)]
pub struct Ingestion {
    pub validate_config: ValidateFn,
    pub fetch_raw: FetchFn,
    /// Must be pure and order-preserving.
    pub normalize: NormalizeFn,
    pub enrich: EnrichFn,
}

impl Ingestion {
    /// Template with no-op validation and identity enrichment.
    pub fn new(fetch_raw: FetchFn, normalize: NormalizeFn) -> Self {
        Self {
            validate_config: Arc::new(|_: &SourceConfig| Ok(())),
            fetch_raw,
            normalize,
            enrich: Arc::new(|items: Vec<NormalizedItem>| futures::future::ready(items).boxed()),
        }
    }

    /// Template for a concrete source kind: its declared requirement,
    /// its fetch, and link extraction.
    pub fn for_source(kind: DataSourceKind, max_links: usize) -> Self {
        let fetch_raw: FetchFn = Arc::new(move |config: SourceConfig| {
            async move {
                let source = DataSource::open(kind, &config).map_err(|e| SourceError::Task(e.to_string()))?;
                let raw: Vec<RawItem> = source.produce().try_collect().await?;
                Ok(raw)
            }
            .boxed()
        });
        let normalize: NormalizeFn = Arc::new(move |raw: Vec<RawItem>| {
            raw.iter()
                .flat_map(|item| links_from_raw(item, max_links))
                .map(NormalizedItem::normalized)
                .collect()
        });

        Self::new(fetch_raw, normalize)
            .with_validate(Arc::new(move |config: &SourceConfig| kind.requirement().check(kind.as_str(), config)))
    }

    pub fn with_validate(mut self, validate: ValidateFn) -> Self {
        self.validate_config = validate;
        self
    }

    pub fn with_enrich(mut self, enrich: EnrichFn) -> Self {
        self.enrich = enrich;
        self
    }

    /// Run all four steps. Validation failures happen before any I/O.
    pub async fn ingest(&self, config: &SourceConfig) -> error::Result<Vec<NormalizedItem>> {
        (self.validate_config)(config)?;
        let raw = (self.fetch_raw)(config.clone()).await?;
        let fetched = raw.len();
        let normalized = (self.normalize)(raw);
        let items = (self.enrich)(normalized).await;
        info!(fetched, items = items.len(), "Ingestion complete");
        Ok(items)
    }
}
