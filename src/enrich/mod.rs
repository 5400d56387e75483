//! Enrichment: classify links through external, rate-limited services.
//!
//! An [`Analyzer`] combines three capabilities:
//! - a [`Classifier`] that turns an identifier (plus optional context)
//!   into a category and description;
//! - an optional primary [`ContentFetcher`] for social posts, whose text
//!   must be fetched before classification;
//! - an optional fallback [`ContentFetcher`] tried when the primary one
//!   is throttled.
//!
//! A throttled call with no fallback content is reported as
//! [`AnalysisOutcome::RateLimited`]; the retry queue picks it up later.
//! Hard errors (auth, other 4xx) are terminal for the item.

pub mod classifier;
pub mod fetch;

pub use classifier::{AnthropicClassifier, CompletionBackend, RigBackend};
pub use fetch::{OEmbedFetcher, PageMetaFetcher};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use tracing::{debug, warn};

use crate::error::{EnrichmentError, StageError};
use crate::pipeline::links::is_social_post;
use crate::pipeline::stage::Stage;
use crate::pipeline::types::{Analysis, NormalizedItem};

// ── Capabilities ────────────────────────────────────────────────────

/// Classifies a link.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, identifier: &str, context: Option<&str>) -> Result<Analysis, EnrichmentError>;
}

/// Fetches extra text for a link. `Ok(None)` means nothing was available.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_content(&self, identifier: &str) -> Result<Option<String>, EnrichmentError>;
}

/// Rate-limit bookkeeping shared by the services and the retry queue.
pub trait RateLimiter: Send + Sync {
    fn is_rate_limited(&self) -> bool;

    /// When the current throttle window ends, if the service said so.
    fn reset_time(&self) -> Option<DateTime<Utc>>;

    fn clear_rate_limit(&self);
}

#[derive(Debug, Default)]
struct LimitWindow {
    limited: bool,
    reset_at: Option<DateTime<Utc>>,
}

/// In-memory [`RateLimiter`], written by the HTTP clients on a 429.
#[derive(Debug, Default)]
pub struct RateLimitState {
    window: Mutex<LimitWindow>,
}

impl RateLimitState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a throttle response. A later reset time wins.
    pub fn mark_limited(&self, reset_at: Option<DateTime<Utc>>) {
        let mut window = self.lock();
        window.limited = true;
        window.reset_at = match (window.reset_at, reset_at) {
            (Some(current), Some(new)) => Some(current.max(new)),
            (current, new) => new.or(current),
        };
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimitWindow> {
        self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RateLimiter for RateLimitState {
    fn is_rate_limited(&self) -> bool {
        self.lock().limited
    }

    fn reset_time(&self) -> Option<DateTime<Utc>> {
        let window = self.lock();
        if window.limited { window.reset_at } else { None }
    }

    fn clear_rate_limit(&self) {
        let mut window = self.lock();
        window.limited = false;
        window.reset_at = None;
    }
}

/// Reset time advertised by a throttle response.
///
/// Reads `x-rate-limit-reset` (epoch seconds) first, then `retry-after`
/// (delta seconds).
pub(crate) fn reset_from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim);

    if let Some(epoch) = header("x-rate-limit-reset").and_then(|v| v.parse::<i64>().ok()) {
        return DateTime::from_timestamp(epoch, 0);
    }
    header("retry-after")
        .and_then(|v| v.parse::<i64>().ok())
        .map(|secs| now + chrono::Duration::seconds(secs.max(0)))
}

// ── Analyzer ────────────────────────────────────────────────────────

/// Result of one enrichment attempt.
#[derive(Debug)]
pub enum AnalysisOutcome {
    Analyzed(Analysis),
    /// Throttled and no fallback content was obtainable.
    RateLimited { reset_at: Option<DateTime<Utc>> },
    /// Terminal for this item; never queued.
    Failed(EnrichmentError),
}

impl AnalysisOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Analyzed(_) => "analyzed",
            Self::RateLimited { .. } => "rate_limited",
            Self::Failed(_) => "failed",
        }
    }
}

/// Fetch-then-classify for one link.
pub struct Analyzer {
    classifier: Arc<dyn Classifier>,
    social: Option<Arc<dyn ContentFetcher>>,
    fallback: Option<Arc<dyn ContentFetcher>>,
    limiter: Arc<dyn RateLimiter>,
}

impl Analyzer {
    pub fn new(classifier: Arc<dyn Classifier>, limiter: Arc<dyn RateLimiter>) -> Self {
        Self {
            classifier,
            social: None,
            fallback: None,
            limiter,
        }
    }

    pub fn with_social(mut self, fetcher: Arc<dyn ContentFetcher>) -> Self {
        self.social = Some(fetcher);
        self
    }

    pub fn with_fallback(mut self, fetcher: Arc<dyn ContentFetcher>) -> Self {
        self.fallback = Some(fetcher);
        self
    }

    pub fn limiter(&self) -> &Arc<dyn RateLimiter> {
        &self.limiter
    }

    /// One enrichment attempt for `item`.
    pub async fn analyze(&self, item: &NormalizedItem) -> AnalysisOutcome {
        let identifier = item.identifier.as_str();

        let context = match (&self.social, is_social_post(identifier)) {
            (Some(social), true) => match social.fetch_content(identifier).await {
                Ok(Some(text)) => Some(text),
                Ok(None) => self.fallback_content(identifier).await,
                Err(EnrichmentError::RateLimited { reset_at, .. }) => {
                    match self.fallback_content(identifier).await {
                        Some(text) => {
                            debug!(identifier, "Primary fetch throttled, using fallback content");
                            Some(text)
                        }
                        None => {
                            return AnalysisOutcome::RateLimited {
                                reset_at: reset_at.or_else(|| self.limiter.reset_time()),
                            };
                        }
                    }
                }
                Err(e) => return AnalysisOutcome::Failed(e),
            },
            _ => None,
        };

        match self.classifier.analyze(identifier, context.as_deref()).await {
            Ok(analysis) => AnalysisOutcome::Analyzed(analysis),
            Err(EnrichmentError::RateLimited { reset_at, .. }) => AnalysisOutcome::RateLimited {
                reset_at: reset_at.or_else(|| self.limiter.reset_time()),
            },
            Err(e) => AnalysisOutcome::Failed(e),
        }
    }

    async fn fallback_content(&self, identifier: &str) -> Option<String> {
        let fallback = self.fallback.as_ref()?;
        match fallback.fetch_content(identifier).await {
            Ok(content) => content.filter(|c| !c.trim().is_empty()),
            Err(e) => {
                debug!(identifier, fetcher = fallback.name(), error = %e, "Fallback fetch failed");
                None
            }
        }
    }
}

// ── Enrichment stage ────────────────────────────────────────────────

/// An item whose enrichment was throttled during the main pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Throttled {
    pub identifier: String,
    pub reset_at: Option<DateTime<Utc>>,
}

/// What the enrichment stage saw during one run.
#[derive(Debug, Default)]
pub struct EnrichmentLog {
    attempted: Mutex<HashSet<String>>,
    throttled: Mutex<Vec<Throttled>>,
    failed: Mutex<Vec<String>>,
}

impl EnrichmentLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Forget everything from a previous run.
    pub fn reset(&self) {
        self.attempted.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.throttled.lock().unwrap_or_else(|p| p.into_inner()).clear();
        self.failed.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// True the first time `identifier` is seen this run.
    fn first_attempt(&self, identifier: &str) -> bool {
        self.attempted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(identifier.to_string())
    }

    fn record_throttled(&self, identifier: &str, reset_at: Option<DateTime<Utc>>) {
        let mut throttled = self.throttled.lock().unwrap_or_else(|p| p.into_inner());
        throttled.push(Throttled {
            identifier: identifier.to_string(),
            reset_at,
        });
    }

    fn record_failed(&self, identifier: &str) {
        let mut failed = self.failed.lock().unwrap_or_else(|p| p.into_inner());
        failed.push(identifier.to_string());
    }

    /// Drain the throttled items.
    pub fn take_throttled(&self) -> Vec<Throttled> {
        std::mem::take(&mut *self.throttled.lock().unwrap_or_else(|p| p.into_inner()))
    }

    /// Identifiers whose enrichment failed with a hard error.
    pub fn failed(&self) -> Vec<String> {
        self.failed.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Pipeline stage that enriches each identifier once per run.
///
/// Complete items pass through untouched, and so do repeats of an
/// identifier already attempted; the consumer drops those as duplicates.
/// Throttled items pass through unclassified and are noted in the
/// [`EnrichmentLog`] for the retry queue. Hard failures pass through with
/// their default classification.
pub struct EnrichStage {
    analyzer: Arc<Analyzer>,
    log: Arc<EnrichmentLog>,
}

impl EnrichStage {
    pub fn new(analyzer: Arc<Analyzer>, log: Arc<EnrichmentLog>) -> Self {
        Self { analyzer, log }
    }
}

#[async_trait]
impl Stage<NormalizedItem, NormalizedItem> for EnrichStage {
    fn name(&self) -> &str {
        "enrich"
    }

    async fn process(&self, item: NormalizedItem) -> Result<Vec<NormalizedItem>, StageError> {
        if item.is_complete() {
            return Ok(vec![item]);
        }
        if !self.log.first_attempt(&item.identifier) {
            debug!(identifier = %item.identifier, "Already attempted this run");
            return Ok(vec![item]);
        }

        let outcome = self.analyzer.analyze(&item).await;
        debug!(identifier = %item.identifier, outcome = outcome.label(), "Enrichment attempt");

        let item = match outcome {
            AnalysisOutcome::Analyzed(analysis) => item.with_analysis(analysis),
            AnalysisOutcome::RateLimited { reset_at } => {
                self.log.record_throttled(&item.identifier, reset_at);
                item
            }
            AnalysisOutcome::Failed(e) => {
                warn!(identifier = %item.identifier, error = %e, "Enrichment failed, keeping default classification");
                self.log.record_failed(&item.identifier);
                item
            }
        };
        Ok(vec![item])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use reqwest::header::HeaderValue;

    // ── Mocks ───────────────────────────────────────────────────

    struct FixedClassifier {
        result: Mutex<VecDeque<Result<Analysis, EnrichmentError>>>,
        seen_context: Mutex<Vec<Option<String>>>,
    }

    impl FixedClassifier {
        fn new(results: Vec<Result<Analysis, EnrichmentError>>) -> Self {
            Self {
                result: Mutex::new(results.into()),
                seen_context: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Classifier for FixedClassifier {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn analyze(&self, _identifier: &str, context: Option<&str>) -> Result<Analysis, EnrichmentError> {
            self.seen_context.lock().unwrap().push(context.map(str::to_string));
            self.result
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Analysis::new("Misc", "default")))
        }
    }

    enum Fetch {
        Content(&'static str),
        Nothing,
        Throttled,
        Auth,
    }

    struct StubFetcher(Fetch);

    #[async_trait]
    impl ContentFetcher for StubFetcher {
        fn name(&self) -> &str {
            "stub"
        }

        async fn fetch_content(&self, _identifier: &str) -> Result<Option<String>, EnrichmentError> {
            match self.0 {
                Fetch::Content(text) => Ok(Some(text.to_string())),
                Fetch::Nothing => Ok(None),
                Fetch::Throttled => Err(EnrichmentError::RateLimited {
                    service: "stub".into(),
                    reset_at: None,
                }),
                Fetch::Auth => Err(EnrichmentError::AuthFailed { service: "stub".into() }),
            }
        }
    }

    fn social_item() -> NormalizedItem {
        NormalizedItem::new("https://x.com/rustlang/status/1", "test", Utc::now())
    }

    fn plain_item() -> NormalizedItem {
        NormalizedItem::new("https://blog.rust-lang.org/", "test", Utc::now())
    }

    // ── RateLimitState ──────────────────────────────────────────

    #[test]
    fn rate_limit_state_tracks_latest_reset() {
        let state = RateLimitState::new();
        assert!(!state.is_rate_limited());

        let early = Utc::now() + chrono::Duration::seconds(5);
        let late = early + chrono::Duration::seconds(30);
        state.mark_limited(Some(late));
        state.mark_limited(Some(early));
        state.mark_limited(None);

        assert!(state.is_rate_limited());
        assert_eq!(state.reset_time(), Some(late));

        state.clear_rate_limit();
        assert!(!state.is_rate_limited());
        assert_eq!(state.reset_time(), None);
    }

    #[test]
    fn reset_from_epoch_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-rate-limit-reset", HeaderValue::from_static("1767225600"));
        let reset = reset_from_headers(&headers, Utc::now()).unwrap();
        assert_eq!(reset.timestamp(), 1_767_225_600);
    }

    #[test]
    fn reset_from_retry_after_header() {
        let now = Utc::now();
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("42"));
        assert_eq!(reset_from_headers(&headers, now), Some(now + chrono::Duration::seconds(42)));
    }

    #[test]
    fn no_reset_headers() {
        assert_eq!(reset_from_headers(&HeaderMap::new(), Utc::now()), None);
    }

    // ── Analyzer ────────────────────────────────────────────────

    #[tokio::test]
    async fn plain_link_is_classified_directly() {
        let classifier = Arc::new(FixedClassifier::new(vec![Ok(Analysis::new("Tech", "Rust blog"))]));
        let analyzer = Analyzer::new(classifier.clone(), RateLimitState::new())
            .with_social(Arc::new(StubFetcher(Fetch::Throttled)));

        let outcome = analyzer.analyze(&plain_item()).await;

        assert!(matches!(outcome, AnalysisOutcome::Analyzed(ref a) if a.category == "Tech"));
        assert_eq!(classifier.seen_context.lock().unwrap()[0], None);
    }

    #[tokio::test]
    async fn social_post_content_becomes_context() {
        let classifier = Arc::new(FixedClassifier::new(vec![]));
        let analyzer = Analyzer::new(classifier.clone(), RateLimitState::new())
            .with_social(Arc::new(StubFetcher(Fetch::Content("Rust 2.0 announced"))));

        let outcome = analyzer.analyze(&social_item()).await;

        assert!(matches!(outcome, AnalysisOutcome::Analyzed(_)));
        assert_eq!(
            classifier.seen_context.lock().unwrap()[0].as_deref(),
            Some("Rust 2.0 announced")
        );
    }

    #[tokio::test]
    async fn throttled_social_fetch_uses_fallback() {
        let classifier = Arc::new(FixedClassifier::new(vec![]));
        let analyzer = Analyzer::new(classifier.clone(), RateLimitState::new())
            .with_social(Arc::new(StubFetcher(Fetch::Throttled)))
            .with_fallback(Arc::new(StubFetcher(Fetch::Content("page title"))));

        let outcome = analyzer.analyze(&social_item()).await;

        assert!(matches!(outcome, AnalysisOutcome::Analyzed(_)));
        assert_eq!(classifier.seen_context.lock().unwrap()[0].as_deref(), Some("page title"));
    }

    #[tokio::test]
    async fn throttled_without_fallback_content_is_rate_limited() {
        let limiter = RateLimitState::new();
        let reset = Utc::now() + chrono::Duration::seconds(60);
        limiter.mark_limited(Some(reset));
        let analyzer = Analyzer::new(Arc::new(FixedClassifier::new(vec![])), limiter)
            .with_social(Arc::new(StubFetcher(Fetch::Throttled)))
            .with_fallback(Arc::new(StubFetcher(Fetch::Nothing)));

        match analyzer.analyze(&social_item()).await {
            AnalysisOutcome::RateLimited { reset_at } => assert_eq!(reset_at, Some(reset)),
            other => panic!("Expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn auth_failure_is_terminal() {
        let analyzer = Analyzer::new(Arc::new(FixedClassifier::new(vec![])), RateLimitState::new())
            .with_social(Arc::new(StubFetcher(Fetch::Auth)));

        let outcome = analyzer.analyze(&social_item()).await;
        assert!(matches!(outcome, AnalysisOutcome::Failed(EnrichmentError::AuthFailed { .. })));
    }

    #[tokio::test]
    async fn throttled_classifier_is_rate_limited() {
        let classifier = Arc::new(FixedClassifier::new(vec![Err(EnrichmentError::RateLimited {
            service: "fixed".into(),
            reset_at: None,
        })]));
        let analyzer = Analyzer::new(classifier, RateLimitState::new());

        assert!(matches!(
            analyzer.analyze(&plain_item()).await,
            AnalysisOutcome::RateLimited { reset_at: None }
        ));
    }

    // ── EnrichStage ─────────────────────────────────────────────

    #[tokio::test]
    async fn stage_records_throttled_items_and_passes_them_through() {
        let classifier = Arc::new(FixedClassifier::new(vec![Err(EnrichmentError::RateLimited {
            service: "fixed".into(),
            reset_at: None,
        })]));
        let log = EnrichmentLog::new();
        let stage = EnrichStage::new(Arc::new(Analyzer::new(classifier, RateLimitState::new())), log.clone());

        let out = stage.process(plain_item()).await.unwrap();

        assert_eq!(out.len(), 1);
        assert!(!out[0].is_complete());
        let throttled = log.take_throttled();
        assert_eq!(throttled.len(), 1);
        assert_eq!(throttled[0].identifier, "https://blog.rust-lang.org/");
        assert!(log.take_throttled().is_empty());
    }

    #[tokio::test]
    async fn stage_keeps_item_on_hard_failure() {
        let classifier = Arc::new(FixedClassifier::new(vec![Err(EnrichmentError::AuthFailed {
            service: "fixed".into(),
        })]));
        let log = EnrichmentLog::new();
        let stage = EnrichStage::new(Arc::new(Analyzer::new(classifier, RateLimitState::new())), log.clone());

        let out = stage.process(plain_item()).await.unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(log.failed(), vec!["https://blog.rust-lang.org/".to_string()]);
        assert!(log.take_throttled().is_empty());
    }

    #[tokio::test]
    async fn stage_calls_classifier_once_per_identifier() {
        let classifier = Arc::new(FixedClassifier::new(vec![]));
        let log = EnrichmentLog::new();
        let stage = EnrichStage::new(
            Arc::new(Analyzer::new(classifier.clone(), RateLimitState::new())),
            log.clone(),
        );

        let first = stage.process(plain_item()).await.unwrap();
        let repeat = stage.process(plain_item()).await.unwrap();

        assert!(first[0].is_complete());
        assert!(!repeat[0].is_complete());
        assert_eq!(classifier.seen_context.lock().unwrap().len(), 1);

        log.reset();
        stage.process(plain_item()).await.unwrap();
        assert_eq!(classifier.seen_context.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stage_skips_complete_items() {
        let classifier = Arc::new(FixedClassifier::new(vec![]));
        let stage = EnrichStage::new(
            Arc::new(Analyzer::new(classifier.clone(), RateLimitState::new())),
            EnrichmentLog::new(),
        );
        let done = plain_item().with_analysis(Analysis::new("Tech", "already"));

        let out = stage.process(done.clone()).await.unwrap();

        assert_eq!(out, vec![done]);
        assert!(classifier.seen_context.lock().unwrap().is_empty());
    }
}
