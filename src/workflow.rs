//! One complete run: executor pass, export, retry pass, export update.
//!
//! Sinks are written right after the main pass so a long rate-limit wait
//! never holds back the bulk of the results. Items resolved by the retry
//! pass are then pushed to every sink through `update_existing`.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::enrich::{AnthropicClassifier, Analyzer, EnrichmentLog, OEmbedFetcher, PageMetaFetcher, RateLimitState};
use crate::error::{self, ConfigError};
use crate::export::{self, CsvExporter, ExportOutcome, Exporter, JsonlExporter};
use crate::pipeline::consumer::{CollectingConsumer, Consumer};
use crate::pipeline::executor::WorkflowExecutor;
use crate::pipeline::source::Source;
use crate::pipeline::stage::Pipeline;
use crate::pipeline::stages::{ExcludeDomains, StageDeps, StageKind, build_pipeline};
use crate::pipeline::types::{NormalizedItem, RawItem, RunStatistics};
use crate::progress::RunObserver;
use crate::retry::{RetryQueueManager, RetryReport, collect_entries};

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source: String,
    pub stats: RunStatistics,
    pub retry: RetryReport,
    /// One entry per sink call, in call order.
    pub exports: Vec<ExportOutcome>,
    /// Identifiers whose enrichment failed with a hard error.
    pub failed_enrichments: Vec<String>,
    /// Final results, retry updates applied.
    pub items: Vec<NormalizedItem>,
}

struct Enrichment {
    log: Arc<EnrichmentLog>,
    retry: RetryQueueManager,
}

/// Source-agnostic run driver.
pub struct Workflow {
    executor: WorkflowExecutor,
    pipeline: Pipeline<RawItem, NormalizedItem>,
    enrichment: Option<Enrichment>,
    exporters: Vec<Arc<dyn Exporter>>,
}

impl Workflow {
    pub fn new(pipeline: Pipeline<RawItem, NormalizedItem>, observer: Arc<dyn RunObserver>) -> Self {
        Self {
            executor: WorkflowExecutor::new(observer),
            pipeline,
            enrichment: None,
            exporters: Vec::new(),
        }
    }

    /// Drain `log` after the main pass and retry its throttled items.
    ///
    /// `log` must be the one the pipeline's enrich stage writes to.
    pub fn with_enrichment(mut self, log: Arc<EnrichmentLog>, retry: RetryQueueManager) -> Self {
        self.enrichment = Some(Enrichment { log, retry });
        self
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exporters.push(exporter);
        self
    }

    /// Wire the pipeline, enrichment and sinks described by `config`.
    ///
    /// The classifier, the social fetcher and the retry queue share one
    /// rate-limit state.
    pub fn from_config(config: &AppConfig, observer: Arc<dyn RunObserver>) -> Result<Self, ConfigError> {
        let mut deps = StageDeps {
            exclude: ExcludeDomains::new(&config.pipeline.exclude_domains),
            enrichment: None,
        };

        let mut enrichment = None;
        if config.pipeline.stages.contains(&StageKind::Enrich)
            && let Some(api_key) = &config.classifier.api_key
        {
            let limiter = RateLimitState::new();
            let classifier = AnthropicClassifier::new(api_key, &config.classifier.model, Arc::clone(&limiter))
                .map_err(|e| ConfigError::InvalidValue {
                    key: "ANTHROPIC_API_KEY".into(),
                    message: e.to_string(),
                })?
                .with_categories(config.classifier.categories.clone());
            let analyzer = Arc::new(
                Analyzer::new(Arc::new(classifier), limiter.clone())
                    .with_social(Arc::new(OEmbedFetcher::new(Arc::clone(&limiter))))
                    .with_fallback(Arc::new(PageMetaFetcher::new())),
            );
            let log = EnrichmentLog::new();
            deps.enrichment = Some((Arc::clone(&analyzer), Arc::clone(&log)));
            enrichment = Some(Enrichment {
                log,
                retry: RetryQueueManager::new(analyzer, config.retry.clone(), Arc::clone(&observer)),
            });
        }

        let pipeline = build_pipeline(config.pipeline.max_links, &config.pipeline.stages, &deps)?;
        let mut workflow = Self::new(pipeline, observer);
        workflow.enrichment = enrichment;

        if let Some(path) = &config.export.csv_path {
            workflow = workflow.with_exporter(Arc::new(CsvExporter::new(path)));
        }
        if let Some(path) = &config.export.jsonl_path {
            workflow = workflow.with_exporter(Arc::new(JsonlExporter::new(path)));
        }
        Ok(workflow)
    }

    pub fn stage_names(&self) -> &[String] {
        self.pipeline.stage_names()
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.exporters.iter().map(|e| e.name()).collect()
    }

    /// Run `source` to completion.
    ///
    /// Only a source failure is an error; sink failures are reported in
    /// [`RunReport::exports`].
    pub async fn run<S>(&self, source: &S) -> error::Result<RunReport>
    where
        S: Source<Item = RawItem> + ?Sized,
    {
        let run_id = Uuid::new_v4();
        info!(%run_id, source = %source.name(), sinks = self.exporters.len(), "Run started");

        if let Some(enrichment) = &self.enrichment {
            enrichment.log.reset();
        }

        let mut consumer = CollectingConsumer::links();
        let stats = self.executor.run(source, &self.pipeline, &mut consumer).await?;

        let mut exports = export::write_all(&self.exporters, consumer.results()).await;

        let (retry, failed_enrichments) = match &self.enrichment {
            Some(enrichment) => {
                let entries = collect_entries(consumer.results(), enrichment.log.take_throttled());
                let report = enrichment.retry.run(entries, consumer.results_mut()).await;
                (report, enrichment.log.failed())
            }
            None => (RetryReport::default(), Vec::new()),
        };

        let items = consumer.into_results();

        exports.extend(export::update_all(&self.exporters, &items, &retry.updated).await);

        info!(
            %run_id,
            consumed = stats.items_consumed,
            errors = stats.errors,
            resolved = retry.resolved,
            "Run finished"
        );

        Ok(RunReport {
            run_id,
            source: source.name().to_string(),
            stats,
            retry,
            exports,
            failed_enrichments,
            items,
        })
    }
}
