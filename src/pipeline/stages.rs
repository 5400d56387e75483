//! Concrete link stages and the factory that assembles them.
//!
//! [`ExtractLinks`] turns a raw message into link items. The item stages
//! after it form a closed set ([`StageKind`]) chosen at runtime from
//! configuration.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::enrich::{Analyzer, EnrichStage, EnrichmentLog};
use crate::error::{ConfigError, StageError};
use crate::pipeline::links::{extract_links, host_of};
use crate::pipeline::stage::{Pipeline, Stage};
use crate::pipeline::types::{NormalizedItem, RawItem};

/// Links kept per raw item unless configured otherwise.
pub const DEFAULT_MAX_LINKS: usize = 1;

// ── Link extraction ─────────────────────────────────────────────────

/// Link items found in one raw item, in order of appearance.
///
/// Pure and order-preserving. An item without links yields nothing.
pub fn links_from_raw(raw: &RawItem, max_links: usize) -> Vec<NormalizedItem> {
    let at = raw.received_at.unwrap_or_else(Utc::now);
    extract_links(&raw.body)
        .into_iter()
        .take(max_links)
        .map(|link| NormalizedItem::new(link, raw.origin.clone(), at))
        .collect()
}

/// First stage: raw item → up to `max_links` link items.
pub struct ExtractLinks {
    max_links: usize,
}

impl ExtractLinks {
    pub fn new(max_links: usize) -> Self {
        Self {
            max_links: max_links.max(1),
        }
    }
}

impl Default for ExtractLinks {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINKS)
    }
}

#[async_trait]
impl Stage<RawItem, NormalizedItem> for ExtractLinks {
    fn name(&self) -> &str {
        "extract"
    }

    async fn process(&self, item: RawItem) -> Result<Vec<NormalizedItem>, StageError> {
        let links = links_from_raw(&item, self.max_links);
        if links.is_empty() {
            debug!(origin = %item.origin, subject = ?item.subject, "No links in item");
        }
        Ok(links)
    }
}

// ── Domain exclusion ────────────────────────────────────────────────

/// Drops links whose host is (or is under) an excluded domain.
#[derive(Debug, Clone, Default)]
pub struct ExcludeDomains {
    domains: Vec<String>,
}

impl ExcludeDomains {
    pub fn new(domains: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        let domains = domains
            .into_iter()
            .map(|d| {
                let d = d.as_ref().trim().to_ascii_lowercase();
                d.strip_prefix("www.").map(str::to_string).unwrap_or(d)
            })
            .filter(|d| !d.is_empty())
            .collect();
        Self { domains }
    }

    pub fn is_excluded(&self, identifier: &str) -> bool {
        let Some(host) = host_of(identifier) else {
            return false;
        };
        self.domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    }
}

// ── Item stages ─────────────────────────────────────────────────────

/// Names of the configurable item stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Normalize,
    Exclude,
    Enrich,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [StageKind::Normalize, StageKind::Exclude, StageKind::Enrich];

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normalize" => Ok(Self::Normalize),
            "exclude" => Ok(Self::Exclude),
            "enrich" => Ok(Self::Enrich),
            other => Err(ConfigError::UnknownStage(other.to_string())),
        }
    }

    /// Comma-separated list, in the given order. Empty entries are ignored.
    pub fn parse_list(s: &str) -> Result<Vec<Self>, ConfigError> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(Self::parse)
            .collect()
    }
}

/// What the item stages may need when built.
#[derive(Default)]
pub struct StageDeps {
    pub exclude: ExcludeDomains,
    pub enrichment: Option<(Arc<Analyzer>, Arc<EnrichmentLog>)>,
}

/// One configured item stage.
pub enum LinkStage {
    Normalize,
    Exclude(ExcludeDomains),
    Enrich(EnrichStage),
}

impl LinkStage {
    pub fn build(kind: StageKind, deps: &StageDeps) -> Result<Self, ConfigError> {
        Ok(match kind {
            StageKind::Normalize => Self::Normalize,
            StageKind::Exclude => Self::Exclude(deps.exclude.clone()),
            StageKind::Enrich => {
                let (analyzer, log) = deps.enrichment.as_ref().ok_or_else(|| ConfigError::MissingRequired {
                    key: "ANTHROPIC_API_KEY".into(),
                    hint: "The enrich stage needs a classifier; set the key or drop 'enrich' from LINKFLOW_STAGES."
                        .into(),
                })?;
                Self::Enrich(EnrichStage::new(Arc::clone(analyzer), Arc::clone(log)))
            }
        })
    }
}

#[async_trait]
impl Stage<NormalizedItem, NormalizedItem> for LinkStage {
    fn name(&self) -> &str {
        match self {
            Self::Normalize => "normalize",
            Self::Exclude(_) => "exclude",
            Self::Enrich(stage) => stage.name(),
        }
    }

    async fn process(&self, item: NormalizedItem) -> Result<Vec<NormalizedItem>, StageError> {
        match self {
            Self::Normalize => {
                let item = item.normalized();
                if item.identifier.is_empty() {
                    return Err(StageError::Failed {
                        stage: "normalize".into(),
                        reason: "empty identifier".into(),
                    });
                }
                Ok(vec![item])
            }
            Self::Exclude(exclude) => {
                if exclude.is_excluded(&item.identifier) {
                    debug!(identifier = %item.identifier, "Excluded by domain");
                    return Ok(Vec::new());
                }
                Ok(vec![item])
            }
            Self::Enrich(stage) => stage.process(item).await,
        }
    }
}

/// Extraction followed by `kinds`, in order.
pub fn build_pipeline(
    max_links: usize,
    kinds: &[StageKind],
    deps: &StageDeps,
) -> Result<Pipeline<RawItem, NormalizedItem>, ConfigError> {
    let mut pipeline = Pipeline::new(ExtractLinks::new(max_links));
    for kind in kinds {
        pipeline = pipeline.then_boxed(Box::new(LinkStage::build(*kind, deps)?));
    }
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::{Classifier, RateLimitState};
    use crate::error::EnrichmentError;
    use crate::pipeline::types::Analysis;

    struct Tagger;

    #[async_trait]
    impl Classifier for Tagger {
        fn name(&self) -> &str {
            "tagger"
        }

        async fn analyze(&self, _identifier: &str, _context: Option<&str>) -> Result<Analysis, EnrichmentError> {
            Ok(Analysis::new("Tech", "tagged"))
        }
    }

    fn raw(body: &str) -> RawItem {
        RawItem::new("test", body)
    }

    // ── Extraction ──────────────────────────────────────────────

    #[test]
    fn first_link_only_by_default() {
        let item = raw("a https://example.com/one and https://example.com/two");
        let links = links_from_raw(&item, DEFAULT_MAX_LINKS);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].identifier, "https://example.com/one");
        assert_eq!(links[0].origin, "test");
    }

    #[test]
    fn fan_out_up_to_max_links() {
        let item = raw("https://a.example/ https://b.example/ https://c.example/");
        assert_eq!(links_from_raw(&item, 2).len(), 2);
    }

    #[test]
    fn received_at_becomes_created_at() {
        let at = "2026-03-10T09:00:00Z".parse().unwrap();
        let item = raw("https://example.com/").with_received_at(at);
        assert_eq!(links_from_raw(&item, 1)[0].created_at, at);
    }

    #[tokio::test]
    async fn item_without_links_is_filtered() {
        let out = ExtractLinks::default().process(raw("no links here")).await.unwrap();
        assert!(out.is_empty());
    }

    // ── Exclusion ───────────────────────────────────────────────

    #[test]
    fn exclusion_covers_subdomains() {
        let exclude = ExcludeDomains::new(["example.com", " WWW.Tracker.io "]);
        assert!(exclude.is_excluded("https://example.com/a"));
        assert!(exclude.is_excluded("https://news.example.com/a"));
        assert!(exclude.is_excluded("https://www.tracker.io/"));
        assert!(!exclude.is_excluded("https://notexample.com/"));
        assert!(!exclude.is_excluded("not a url"));
    }

    // ── Stage kinds ─────────────────────────────────────────────

    #[test]
    fn parse_stage_list() {
        assert_eq!(
            StageKind::parse_list("normalize, exclude,,enrich").unwrap(),
            StageKind::ALL.to_vec()
        );
        assert!(matches!(
            StageKind::parse_list("normalize,shout"),
            Err(ConfigError::UnknownStage(ref s)) if s == "shout"
        ));
    }

    #[test]
    fn enrich_requires_an_analyzer() {
        let result = LinkStage::build(StageKind::Enrich, &StageDeps::default());
        assert!(matches!(result, Err(ConfigError::MissingRequired { .. })));
    }

    // ── Assembled pipeline ──────────────────────────────────────

    #[tokio::test]
    async fn full_pipeline_normalizes_filters_and_enriches() {
        let log = EnrichmentLog::new();
        let deps = StageDeps {
            exclude: ExcludeDomains::new(["ads.example"]),
            enrichment: Some((Arc::new(Analyzer::new(Arc::new(Tagger), RateLimitState::new())), log)),
        };
        let pipeline = build_pipeline(2, &StageKind::ALL, &deps).unwrap();

        assert_eq!(pipeline.stage_names(), &["extract", "normalize", "exclude", "enrich"]);

        let out = pipeline
            .run(raw("https://ads.example/x https://Docs.RS/tokio?utm_source=mail"))
            .await
            .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].identifier, "https://docs.rs/tokio");
        assert!(out[0].is_complete());
    }
}
